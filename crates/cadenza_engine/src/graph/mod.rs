//! Graph arena: modules, ports, subgraphs and the derived topology tables.
//!
//! Ownership is strictly arena-shaped: ports belong to modules, modules to
//! subgraphs, subgraphs to the graph. Every cross-reference is a plain index
//! newtype, never a pointer, so detach-before-free reduces to flipping a
//! status and re-deriving the sorted tables.

pub mod module;
pub mod port;

use crate::error::{EngineError, Result};
use cadenza_protocol::{ModuleIid, PortId, SubgraphId};
use module::{AudioModule, GraphStatus, ModuleFlags, ModuleNode};
pub use module::{InPortId, ModuleId, OutPortId, SgIdx};
use port::{PortCommon, PortState};
use std::collections::HashMap;

#[derive(Debug)]
pub struct Subgraph {
    pub id: SubgraphId,
    pub state: PortState,
    pub status: GraphStatus,
}

#[derive(Debug)]
pub struct InPort {
    pub common: PortCommon,
    pub module: ModuleId,
    pub conn: Option<OutPortId>,
    /// Index into the container's external input port table, when external.
    pub ext: Option<usize>,
    /// Downstream end of the non-buffering linear chain through this port.
    pub nblc_end: InPortId,
}

#[derive(Debug)]
pub struct OutPort {
    pub common: PortCommon,
    pub module: ModuleId,
    pub conn: Option<InPortId>,
    pub ext: Option<usize>,
    /// Upstream start of the non-buffering linear chain through this port.
    pub nblc_start: OutPortId,
}

#[derive(Default)]
pub struct Graph {
    pub nodes: Vec<ModuleNode>,
    /// Processing behavior, parallel to `nodes`. Kept separate so the
    /// driver can borrow a processor and port buffers simultaneously.
    pub procs: Vec<Box<dyn AudioModule>>,
    pub in_ports: Vec<InPort>,
    pub out_ports: Vec<OutPort>,
    pub subgraphs: Vec<Subgraph>,
    /// Active modules in topological order.
    pub sorted: Vec<ModuleId>,
    pub num_parallel_paths: usize,
    iid_index: HashMap<ModuleIid, ModuleId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: ModuleId) -> &ModuleNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: ModuleId) -> &mut ModuleNode {
        &mut self.nodes[id.0]
    }

    pub fn in_port(&self, id: InPortId) -> &InPort {
        &self.in_ports[id.0]
    }

    pub fn in_port_mut(&mut self, id: InPortId) -> &mut InPort {
        &mut self.in_ports[id.0]
    }

    pub fn out_port(&self, id: OutPortId) -> &OutPort {
        &self.out_ports[id.0]
    }

    pub fn out_port_mut(&mut self, id: OutPortId) -> &mut OutPort {
        &mut self.out_ports[id.0]
    }

    pub fn subgraph(&self, idx: SgIdx) -> &Subgraph {
        &self.subgraphs[idx.0]
    }

    pub fn find_module(&self, iid: ModuleIid) -> Option<ModuleId> {
        self.iid_index.get(&iid).copied().filter(|id| {
            self.nodes[id.0].status == GraphStatus::Active
        })
    }

    pub fn find_subgraph(&self, id: SubgraphId) -> Option<SgIdx> {
        self.subgraphs
            .iter()
            .position(|sg| sg.id == id && sg.status == GraphStatus::Active)
            .map(SgIdx)
    }

    pub fn add_subgraph(&mut self, id: SubgraphId) -> SgIdx {
        if let Some(idx) = self.find_subgraph(id) {
            return idx;
        }
        self.subgraphs.push(Subgraph { id, state: PortState::Invalid, status: GraphStatus::Active });
        SgIdx(self.subgraphs.len() - 1)
    }

    pub fn add_module(
        &mut self,
        iid: ModuleIid,
        sg: SgIdx,
        flags: ModuleFlags,
        processor: Box<dyn AudioModule>,
    ) -> Result<ModuleId> {
        if self.find_module(iid).is_some() {
            return Err(EngineError::bad_param(format!("duplicate module {iid}")));
        }
        let id = ModuleId(self.nodes.len());
        self.nodes.push(ModuleNode {
            iid,
            sg,
            flags,
            inplace: false,
            disabled: false,
            num_proc_loops: 1,
            headroom_bytes_per_ch: 0,
            path_index: 0,
            in_ports: Vec::new(),
            out_ports: Vec::new(),
            status: GraphStatus::Active,
        });
        self.procs.push(processor);
        self.iid_index.insert(iid, id);
        Ok(id)
    }

    pub fn add_in_port(&mut self, module: ModuleId, port_id: PortId) -> InPortId {
        let id = InPortId(self.in_ports.len());
        self.in_ports.push(InPort {
            common: PortCommon::new(port_id),
            module,
            conn: None,
            ext: None,
            nblc_end: id,
        });
        self.nodes[module.0].in_ports.push(id);
        id
    }

    pub fn add_out_port(&mut self, module: ModuleId, port_id: PortId) -> OutPortId {
        let id = OutPortId(self.out_ports.len());
        self.out_ports.push(OutPort {
            common: PortCommon::new(port_id),
            module,
            conn: None,
            ext: None,
            nblc_start: id,
        });
        self.nodes[module.0].out_ports.push(id);
        id
    }

    pub fn connect(&mut self, from: OutPortId, to: InPortId) -> Result<()> {
        if self.out_ports[from.0].conn.is_some() || self.in_ports[to.0].conn.is_some() {
            return Err(EngineError::bad_param("port already connected"));
        }
        self.out_ports[from.0].conn = Some(to);
        self.in_ports[to.0].conn = Some(from);
        Ok(())
    }

    pub fn disconnect(&mut self, from: OutPortId, to: InPortId) -> Result<()> {
        if self.out_ports[from.0].conn != Some(to) {
            return Err(EngineError::bad_param("ports not connected"));
        }
        self.out_ports[from.0].conn = None;
        self.in_ports[to.0].conn = None;
        Ok(())
    }

    pub fn active_modules(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.status == GraphStatus::Active)
            .map(|(i, _)| ModuleId(i))
    }

    /// Recompute sorted order, parallel-path indices and nblc chains. Call
    /// after any structural change, inside the graph critical section.
    pub fn refresh(&mut self) -> Result<()> {
        self.topo_sort()?;
        self.assign_parallel_paths();
        self.compute_nblc();
        Ok(())
    }

    fn topo_sort(&mut self) -> Result<()> {
        let mut indegree: HashMap<ModuleId, usize> =
            self.active_modules().map(|m| (m, 0)).collect();
        for ip in &self.in_ports {
            if ip.conn.is_some() && self.nodes[ip.module.0].status == GraphStatus::Active {
                *indegree.get_mut(&ip.module).expect("active module") += 1;
            }
        }
        let mut ready: Vec<ModuleId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(m, _)| *m)
            .collect();
        ready.sort();

        let mut sorted = Vec::with_capacity(indegree.len());
        while let Some(m) = ready.pop() {
            sorted.push(m);
            for &op in &self.nodes[m.0].out_ports {
                if let Some(next_in) = self.out_ports[op.0].conn {
                    let next = self.in_ports[next_in.0].module;
                    if let Some(d) = indegree.get_mut(&next) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(next);
                        }
                    }
                }
            }
        }
        if sorted.len() != indegree.len() {
            return Err(EngineError::topology("cycle in module graph"));
        }
        self.sorted = sorted;
        Ok(())
    }

    /// Parallel paths are the weakly-connected components of the graph.
    fn assign_parallel_paths(&mut self) {
        let mut path_of: HashMap<ModuleId, usize> = HashMap::new();
        let mut num_paths = 0;
        let active: Vec<ModuleId> = self.active_modules().collect();
        for &start in &active {
            if path_of.contains_key(&start) {
                continue;
            }
            let path = num_paths;
            num_paths += 1;
            let mut stack = vec![start];
            while let Some(m) = stack.pop() {
                if path_of.insert(m, path).is_some() {
                    continue;
                }
                for &op in &self.nodes[m.0].out_ports {
                    if let Some(next_in) = self.out_ports[op.0].conn {
                        stack.push(self.in_ports[next_in.0].module);
                    }
                }
                for &ip in &self.nodes[m.0].in_ports {
                    if let Some(prev_out) = self.in_ports[ip.0].conn {
                        stack.push(self.out_ports[prev_out.0].module);
                    }
                }
            }
        }
        for (m, path) in path_of {
            self.nodes[m.0].path_index = path;
        }
        self.num_parallel_paths = num_paths.max(1);
    }

    /// A non-buffering linear chain crosses SISO modules that do not hold
    /// data. `nblc_end` of an input port is the furthest downstream input in
    /// its chain; `nblc_start` of an output port the furthest upstream
    /// output.
    fn compute_nblc(&mut self) {
        let chains_through = |node: &ModuleNode| {
            node.is_siso() && !node.flags.contains(ModuleFlags::REQUIRES_DATA_BUFFER)
        };

        for i in 0..self.in_ports.len() {
            let mut cur = InPortId(i);
            loop {
                let node = &self.nodes[self.in_ports[cur.0].module.0];
                if !chains_through(node) {
                    break;
                }
                let out = node.out_ports[0];
                match self.out_ports[out.0].conn {
                    Some(next) => cur = next,
                    None => break,
                }
            }
            self.in_ports[i].nblc_end = cur;
        }

        for i in 0..self.out_ports.len() {
            let mut cur = OutPortId(i);
            loop {
                let node = &self.nodes[self.out_ports[cur.0].module.0];
                if !chains_through(node) {
                    break;
                }
                let inp = node.in_ports[0];
                match self.in_ports[inp.0].conn {
                    Some(prev) => cur = prev,
                    None => break,
                }
            }
            self.out_ports[i].nblc_start = cur;
        }
    }

    /// Phase one of destroy: mark a subgraph and everything it owns closing,
    /// inside the critical section. The data path stops seeing the modules
    /// at the next `refresh`.
    pub fn mark_subgraph_closing(&mut self, sg: SgIdx) {
        self.subgraphs[sg.0].status = GraphStatus::Closing;
        for node in self.nodes.iter_mut().filter(|n| n.sg == sg) {
            node.status = GraphStatus::Closing;
        }
    }

    /// Phase two of destroy: reclaim buffers and detach connections of
    /// closing modules, outside the critical section.
    pub fn purge_closing(&mut self) {
        let closing: Vec<ModuleId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.status == GraphStatus::Closing)
            .map(|(i, _)| ModuleId(i))
            .collect();
        for m in closing {
            let (in_ports, out_ports) = {
                let node = &self.nodes[m.0];
                (node.in_ports.clone(), node.out_ports.clone())
            };
            for ip in in_ports {
                if let Some(from) = self.in_ports[ip.0].conn.take() {
                    self.out_ports[from.0].conn = None;
                }
                self.in_ports[ip.0].common.reset_data();
                self.in_ports[ip.0].common.bufs.deallocate();
            }
            for op in out_ports {
                if let Some(to) = self.out_ports[op.0].conn.take() {
                    self.in_ports[to.0].conn = None;
                }
                self.out_ports[op.0].common.reset_data();
                self.out_ports[op.0].common.bufs.deallocate();
            }
            self.iid_index.remove(&self.nodes[m.0].iid);
        }
    }

    /// The single signal-triggered module, if any. More than one is a
    /// topology error.
    pub fn stm_module(&self) -> Result<Option<ModuleId>> {
        let mut found = None;
        for m in self.active_modules() {
            if self.nodes[m.0].is_signal_triggered() {
                if found.is_some() {
                    return Err(EngineError::topology("more than one signal-triggered module"));
                }
                found = Some(m);
            }
        }
        Ok(found)
    }

    pub fn num_data_tpm(&self) -> usize {
        self.active_modules()
            .filter(|m| self.nodes[m.0].data_trigger_policy_active())
            .count()
    }

    pub fn any_source_module(&self) -> bool {
        self.active_modules().any(|m| self.nodes[m.0].is_source())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::StreamData;
    use crate::events::EventCtx;

    struct Nop;
    impl AudioModule for Nop {
        fn process(
            &mut self,
            _ctx: &mut EventCtx,
            _inputs: &mut [StreamData],
            _outputs: &mut [StreamData],
        ) -> Result<()> {
            Ok(())
        }
    }

    fn chain(graph: &mut Graph, sg: SgIdx, iids: &[u32]) -> Vec<ModuleId> {
        let mods: Vec<ModuleId> = iids
            .iter()
            .map(|&iid| {
                graph
                    .add_module(ModuleIid::new(iid), sg, ModuleFlags::empty(), Box::new(Nop))
                    .unwrap()
            })
            .collect();
        for w in mods.windows(2) {
            let out = graph.add_out_port(w[0], PortId::new(1));
            let inp = graph.add_in_port(w[1], PortId::new(2));
            graph.connect(out, inp).unwrap();
        }
        mods
    }

    #[test]
    fn sort_is_topological() {
        let mut g = Graph::new();
        let sg = g.add_subgraph(SubgraphId::new(1));
        let mods = chain(&mut g, sg, &[0x10, 0x20, 0x30]);
        g.refresh().unwrap();
        let pos: Vec<usize> =
            mods.iter().map(|m| g.sorted.iter().position(|s| s == m).unwrap()).collect();
        assert!(pos[0] < pos[1] && pos[1] < pos[2]);
    }

    #[test]
    fn parallel_paths_are_components() {
        let mut g = Graph::new();
        let sg = g.add_subgraph(SubgraphId::new(1));
        let a = chain(&mut g, sg, &[0x10, 0x20]);
        let b = chain(&mut g, sg, &[0x30, 0x40]);
        g.refresh().unwrap();
        assert_eq!(g.num_parallel_paths, 2);
        assert_eq!(g.node(a[0]).path_index, g.node(a[1]).path_index);
        assert_ne!(g.node(a[0]).path_index, g.node(b[0]).path_index);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut g = Graph::new();
        let sg = g.add_subgraph(SubgraphId::new(1));
        let mods = chain(&mut g, sg, &[0x10, 0x20]);
        let back_out = g.add_out_port(mods[1], PortId::new(3));
        let back_in = g.add_in_port(mods[0], PortId::new(4));
        g.connect(back_out, back_in).unwrap();
        assert!(g.refresh().is_err());
    }

    #[test]
    fn nblc_spans_siso_chain() {
        let mut g = Graph::new();
        let sg = g.add_subgraph(SubgraphId::new(1));
        // src -> a -> b -> sink; a and b are SISO pass-through
        let mods = chain(&mut g, sg, &[1, 2, 3, 4]);
        g.refresh().unwrap();
        let first_in = g.node(mods[1]).in_ports[0];
        let last_in = g.node(mods[3]).in_ports[0];
        assert_eq!(g.in_port(first_in).nblc_end, last_in);
        let last_out = g.node(mods[2]).out_ports[0];
        let first_out = g.node(mods[0]).out_ports[0];
        assert_eq!(g.out_port(last_out).nblc_start, first_out);
    }

    #[test]
    fn buffering_module_breaks_nblc() {
        let mut g = Graph::new();
        let sg = g.add_subgraph(SubgraphId::new(1));
        let mods = chain(&mut g, sg, &[1, 2, 3]);
        g.node_mut(mods[1]).flags |= ModuleFlags::REQUIRES_DATA_BUFFER;
        g.refresh().unwrap();
        let first_in = g.node(mods[1]).in_ports[0];
        assert_eq!(g.in_port(first_in).nblc_end, first_in);
    }

    #[test]
    fn closing_modules_leave_sorted_order() {
        let mut g = Graph::new();
        let sg1 = g.add_subgraph(SubgraphId::new(1));
        let sg2 = g.add_subgraph(SubgraphId::new(2));
        let _a = chain(&mut g, sg1, &[1, 2]);
        let b = chain(&mut g, sg2, &[3, 4]);
        g.refresh().unwrap();
        assert_eq!(g.sorted.len(), 4);
        g.mark_subgraph_closing(sg2);
        g.purge_closing();
        g.refresh().unwrap();
        assert_eq!(g.sorted.len(), 2);
        assert!(!g.sorted.contains(&b[0]));
        assert!(g.find_module(ModuleIid::new(3)).is_none());
    }

    #[test]
    fn single_stm_rule() {
        let mut g = Graph::new();
        let sg = g.add_subgraph(SubgraphId::new(1));
        let mods = chain(&mut g, sg, &[1, 2]);
        g.node_mut(mods[0]).flags |= ModuleFlags::NEEDS_SIGNAL_TRIGGER;
        assert_eq!(g.stm_module().unwrap(), Some(mods[0]));
        g.node_mut(mods[1]).flags |= ModuleFlags::NEEDS_SIGNAL_TRIGGER;
        assert!(g.stm_module().is_err());
    }
}
