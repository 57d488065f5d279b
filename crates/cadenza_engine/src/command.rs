//! Control-path commands: payload types, the dispatcher, and the lifecycle
//! handlers.
//!
//! Commands arrive on the bounded command queue and are processed one at a
//! time; a handler runs to completion before any data pass resumes. Handlers
//! that mutate graph topology hold the container's critical section.

use crate::container::{Container, ContainerHandle};
use crate::error::{EngineError, Result};
use crate::events::FwkEventFlags;
use crate::graph::module::{AudioModule, InPortId, ModuleFlags, OutPortId};
use crate::graph::port::PortState;
use cadenza_protocol::{
    AckCode, DataMsg, FrameLenUpdate, InPortMsg, MediaFormat, ModuleIid, OutPortMsg, PortId,
    SubgraphId,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

/// Event callbacks delivered to registered clients.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    FrameDone { frame_us: u64 },
    MediaFormatChanged { module: ModuleIid, mf: MediaFormat },
    EosDisposition { module: ModuleIid, rendered: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRef {
    pub id: PortId,
    pub is_input: bool,
}

pub struct ThresholdDecl {
    pub port: PortRef,
    pub bytes: u64,
}

pub struct MediaFmtDecl {
    pub port: PortRef,
    pub mf: MediaFormat,
}

/// One module in a graph-open payload.
pub struct ModuleDef {
    pub iid: ModuleIid,
    pub sg: SubgraphId,
    pub flags: ModuleFlags,
    pub inplace: bool,
    pub headroom_bytes_per_ch: usize,
    pub in_ports: Vec<PortId>,
    pub out_ports: Vec<PortId>,
    pub thresholds: Vec<ThresholdDecl>,
    pub media_fmts: Vec<MediaFmtDecl>,
    pub processor: Box<dyn AudioModule>,
}

pub struct ConnDef {
    pub from: (ModuleIid, PortId),
    pub to: (ModuleIid, PortId),
}

/// Declares an external input: the container takes the consumer end of the
/// queue, the upstream peer keeps the producer.
pub struct ExtInDecl {
    pub module: ModuleIid,
    pub port: PortId,
    pub rx: Receiver<InPortMsg>,
}

/// Declares an external output: the container delivers on `tx` and waits on
/// `buf_rx` for returned empties.
pub struct ExtOutDecl {
    pub module: ModuleIid,
    pub port: PortId,
    pub tx: Sender<OutPortMsg>,
    pub buf_rx: Receiver<DataMsg>,
}

pub struct GraphOpenPayload {
    pub subgraphs: Vec<SubgraphId>,
    pub modules: Vec<ModuleDef>,
    pub connections: Vec<ConnDef>,
    pub ext_ins: Vec<ExtInDecl>,
    pub ext_outs: Vec<ExtOutDecl>,
}

/// Cross-container property updates on an external port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPortProperty {
    UpstreamRealTime(bool),
    DownstreamRealTime(bool),
    PortState(PortState),
}

pub enum Command {
    GraphOpen(GraphOpenPayload),
    GraphPrepare(Vec<SubgraphId>),
    GraphStart(Vec<SubgraphId>),
    GraphSuspend(Vec<SubgraphId>),
    GraphStop(Vec<SubgraphId>),
    GraphFlush(Vec<SubgraphId>),
    GraphClose(Vec<SubgraphId>),
    GraphConnect { from: (ModuleIid, PortId), to: (ModuleIid, PortId) },
    GraphDisconnect { from: (ModuleIid, PortId), to: (ModuleIid, PortId) },
    SetCfg { module: ModuleIid, param_id: u32, payload: Vec<u8> },
    GetCfg { module: ModuleIid, param_id: u32 },
    RegisterCfg { module: ModuleIid, param_id: u32, payload: Vec<u8> },
    DeregisterCfg { module: ModuleIid, param_id: u32 },
    CtrlPathMediaFormat { module: ModuleIid, port: PortId, mf: MediaFormat },
    InformIcb { module: ModuleIid, port: PortId, update: FrameLenUpdate, real_time: bool },
    PeerPortPropertyUpdate { module: ModuleIid, port: PortId, property: PeerPortProperty },
    UpstreamStopped { module: ModuleIid, port: PortId },
    CtrlPortTrigger { module: ModuleIid, param_id: u32, payload: Vec<u8> },
    RegisterEvents { client: Sender<ClientEvent> },
    Destroy,
}

pub struct CommandMsg {
    pub cmd: Command,
    pub ack_tx: Option<Sender<CmdAck>>,
}

#[derive(Debug, Clone)]
pub struct CmdAck {
    pub code: AckCode,
    pub payload: Option<Vec<u8>>,
}

impl ContainerHandle {
    /// Enqueue a command; the returned receiver yields the ack.
    pub fn send(&self, cmd: Command) -> Receiver<CmdAck> {
        let (ack_tx, ack_rx) = bounded(1);
        let msg = CommandMsg { cmd, ack_tx: Some(ack_tx) };
        let _ = self.cmd_tx.send(msg);
        ack_rx
    }

    /// Enqueue and block for the ack; for use from a peer thread.
    pub fn call(&self, cmd: Command) -> CmdAck {
        match self.send(cmd).recv() {
            Ok(ack) => ack,
            Err(_) => CmdAck { code: AckCode::Terminated, payload: None },
        }
    }
}

impl Container {
    pub(crate) fn dispatch_command(&mut self, msg: CommandMsg) {
        let mut payload = None;
        let result = match msg.cmd {
            Command::GraphOpen(p) => self.cmd_graph_open(p),
            Command::GraphPrepare(sgs) => self.cmd_graph_prepare(&sgs),
            Command::GraphStart(sgs) => self.cmd_graph_start(&sgs),
            Command::GraphSuspend(sgs) => self.cmd_graph_suspend(&sgs),
            Command::GraphStop(sgs) => self.cmd_graph_stop(&sgs),
            Command::GraphFlush(sgs) => self.cmd_graph_flush(&sgs),
            Command::GraphClose(sgs) => self.cmd_graph_close(&sgs),
            Command::GraphConnect { from, to } => self.cmd_connect(from, to, true),
            Command::GraphDisconnect { from, to } => self.cmd_connect(from, to, false),
            Command::SetCfg { module, param_id, payload } => {
                self.cmd_set_cfg(module, param_id, &payload)
            }
            Command::GetCfg { module, param_id } => match self.cmd_get_cfg(module, param_id) {
                Ok(data) => {
                    payload = Some(data);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Command::RegisterCfg { module, param_id, payload } => {
                self.cached_cfgs.retain(|(m, p, _)| !(*m == module && *p == param_id));
                self.cached_cfgs.push((module, param_id, payload));
                Ok(())
            }
            Command::DeregisterCfg { module, param_id } => {
                self.cached_cfgs.retain(|(m, p, _)| !(*m == module && *p == param_id));
                Ok(())
            }
            Command::CtrlPathMediaFormat { module, port, mf } => {
                self.cmd_ctrl_media_fmt(module, port, mf)
            }
            Command::InformIcb { module, port, update, real_time } => {
                self.cmd_inform_icb(module, port, update, real_time)
            }
            Command::PeerPortPropertyUpdate { module, port, property } => {
                self.cmd_peer_property(module, port, property)
            }
            Command::UpstreamStopped { module, port } => self.cmd_upstream_stopped(module, port),
            Command::CtrlPortTrigger { module, param_id, payload } => {
                // control-port payloads are opaque; delivered as set-param
                self.cmd_set_cfg(module, param_id, &payload)
            }
            Command::RegisterEvents { client } => {
                self.event_clients.push(client);
                Ok(())
            }
            Command::Destroy => {
                self.cmd_destroy();
                Err(EngineError::Terminated)
            }
        };

        let code = match &result {
            Ok(()) => AckCode::Ok,
            Err(e) => {
                if !matches!(e, EngineError::Terminated) {
                    warn!(error = %e, "command failed");
                }
                e.ack_code()
            }
        };
        if let Some(ack_tx) = msg.ack_tx {
            let _ = ack_tx.try_send(CmdAck { code, payload });
        }
    }

    fn find_in_port(&self, module: ModuleIid, port: PortId) -> Result<InPortId> {
        let m = self
            .graph
            .find_module(module)
            .ok_or_else(|| EngineError::bad_param(format!("unknown module {module}")))?;
        self.graph
            .node(m)
            .in_ports
            .iter()
            .copied()
            .find(|&ip| self.graph.in_port(ip).common.id == port)
            .ok_or_else(|| EngineError::bad_param(format!("unknown input port {port} on {module}")))
    }

    fn find_out_port(&self, module: ModuleIid, port: PortId) -> Result<OutPortId> {
        let m = self
            .graph
            .find_module(module)
            .ok_or_else(|| EngineError::bad_param(format!("unknown module {module}")))?;
        self.graph
            .node(m)
            .out_ports
            .iter()
            .copied()
            .find(|&op| self.graph.out_port(op).common.id == port)
            .ok_or_else(|| {
                EngineError::bad_param(format!("unknown output port {port} on {module}"))
            })
    }

    fn cmd_graph_open(&mut self, p: GraphOpenPayload) -> Result<()> {
        let critical = self.critical.clone();
        let _guard = critical.lock();

        let pre_sgs = self.graph.subgraphs.len();
        let pre_ext_in = self.ext_in.len();
        let pre_ext_out = self.ext_out.len();

        let result = self.graph_open_inner(p);
        if let Err(e) = &result {
            warn!(error = %e, "graph open failed; rolling back");
            while self.ext_in.len() > pre_ext_in {
                self.detach_ext_in(self.ext_in.len() - 1);
            }
            while self.ext_out.len() > pre_ext_out {
                self.detach_ext_out(self.ext_out.len() - 1);
            }
            for i in pre_sgs..self.graph.subgraphs.len() {
                self.graph.mark_subgraph_closing(crate::graph::module::SgIdx(i));
            }
            self.graph.purge_closing();
            let _ = self.graph.refresh();
        }
        result
    }

    fn graph_open_inner(&mut self, p: GraphOpenPayload) -> Result<()> {
        for sg in &p.subgraphs {
            self.graph.add_subgraph(*sg);
        }
        for def in p.modules {
            let sg = self
                .graph
                .find_subgraph(def.sg)
                .ok_or_else(|| EngineError::bad_param(format!("unknown subgraph {}", def.sg)))?;
            let m = self.graph.add_module(def.iid, sg, def.flags, def.processor)?;
            self.graph.node_mut(m).inplace = def.inplace;
            self.graph.node_mut(m).headroom_bytes_per_ch = def.headroom_bytes_per_ch;
            for pid in def.in_ports {
                self.graph.add_in_port(m, pid);
            }
            for pid in def.out_ports {
                self.graph.add_out_port(m, pid);
            }
            for t in def.thresholds {
                if t.port.is_input {
                    let ip = self.find_in_port(def.iid, t.port.id)?;
                    self.graph.in_port_mut(ip).common.threshold.raised_bytes = Some(t.bytes);
                } else {
                    let op = self.find_out_port(def.iid, t.port.id)?;
                    self.graph.out_port_mut(op).common.threshold.raised_bytes = Some(t.bytes);
                }
            }
            for decl in def.media_fmts {
                decl.mf.validate()?;
                if decl.port.is_input {
                    let ip = self.find_in_port(def.iid, decl.port.id)?;
                    self.graph.in_port_mut(ip).common.media_fmt = Some(decl.mf);
                } else {
                    let op = self.find_out_port(def.iid, decl.port.id)?;
                    self.graph.out_port_mut(op).common.media_fmt = Some(decl.mf);
                }
            }
        }
        for conn in p.connections {
            let from = self.find_out_port(conn.from.0, conn.from.1)?;
            let to = self.find_in_port(conn.to.0, conn.to.1)?;
            self.graph.connect(from, to)?;
        }
        for decl in p.ext_ins {
            let ip = self.find_in_port(decl.module, decl.port)?;
            self.attach_ext_in(ip, decl.rx)?;
        }
        for decl in p.ext_outs {
            let op = self.find_out_port(decl.module, decl.port)?;
            self.attach_ext_out(op, decl.tx, decl.buf_rx)?;
        }
        self.graph.refresh()?;
        // a second signal-triggered module is rejected at open
        self.stm.module = self.graph.stm_module()?;

        // modules that need the container frame or process duration get it
        // after this handler returns; the threshold pass that computes it is
        // a single-shot continuation run before the next wait
        let needs_durations = self.graph.sorted.iter().any(|&m| {
            self.graph.node(m).flags.intersects(
                ModuleFlags::NEEDS_FRAME_DURATION | ModuleFlags::NEEDS_PROC_DURATION,
            )
        });
        if needs_durations {
            self.pending_continuation =
                Some(Box::new(|c: &mut Container| c.recompute_thresholds_and_buffers()));
        }

        info!(
            modules = self.graph.sorted.len(),
            ext_in = self.ext_in.len(),
            ext_out = self.ext_out.len(),
            "graph opened"
        );
        Ok(())
    }

    fn sgs_indices(&self, sgs: &[SubgraphId]) -> Result<Vec<crate::graph::module::SgIdx>> {
        sgs.iter()
            .map(|id| {
                self.graph
                    .find_subgraph(*id)
                    .ok_or_else(|| EngineError::bad_param(format!("unknown subgraph {id}")))
            })
            .collect()
    }

    fn cmd_graph_prepare(&mut self, sgs: &[SubgraphId]) -> Result<()> {
        // apply registered configuration first
        let cached = std::mem::take(&mut self.cached_cfgs);
        for (module, param_id, payload) in &cached {
            if let Err(e) = self.cmd_set_cfg(*module, *param_id, payload) {
                warn!(module = %module, param_id, error = %e, "cached cfg failed");
            }
        }
        self.cached_cfgs = cached;

        self.propagate_media_formats();
        for sg in self.sgs_indices(sgs)? {
            self.apply_subgraph_state(sg, PortState::Prepared);
        }
        self.recompute_thresholds_and_buffers()?;
        Ok(())
    }

    fn cmd_graph_start(&mut self, sgs: &[SubgraphId]) -> Result<()> {
        for sg in self.sgs_indices(sgs)? {
            self.apply_subgraph_state(sg, PortState::Started);
        }
        // a stopped-then-started graph with unchanged modules must keep its
        // buffer sizes; recompute is cheap and idempotent
        self.recompute_thresholds_and_buffers()?;

        if let Some(stm) = self.stm.module {
            let stm_started =
                self.graph.subgraph(self.graph.node(stm).sg).state == PortState::Started;
            if stm_started {
                if self.timer_rx.is_none() {
                    return Err(EngineError::failed("signal-triggered start without a timer"));
                }
                self.stm.active = true;
                self.start_listen(cadenza_protocol::TIMER_BIT_MASK);
            }
        }
        self.update_kpps_bw(false);
        info!(frame_us = self.frame.len_us(), "graph started");
        Ok(())
    }

    fn cmd_graph_suspend(&mut self, sgs: &[SubgraphId]) -> Result<()> {
        for sg in self.sgs_indices(sgs)? {
            self.apply_subgraph_state(sg, PortState::Suspended);
        }
        self.refresh_stm_active();
        if !self.is_started() {
            self.release_votes();
        }
        Ok(())
    }

    fn cmd_graph_stop(&mut self, sgs: &[SubgraphId]) -> Result<()> {
        let stm_stopping = self.stm.module.map_or(false, |stm| {
            let sg = self.graph.node(stm).sg;
            self.sgs_indices(sgs)
                .map(|list| list.contains(&sg))
                .unwrap_or(false)
        });

        for sg in self.sgs_indices(sgs)? {
            self.apply_subgraph_state(sg, PortState::Stopped);
        }
        if stm_stopping {
            self.reset_downstream_of_stm_and_send_eos()?;
        }
        self.refresh_stm_active();
        if !self.is_started() {
            self.release_votes();
        }
        self.fwk_events |= FwkEventFlags::VOTE_RELEASE;
        Ok(())
    }

    fn cmd_graph_flush(&mut self, sgs: &[SubgraphId]) -> Result<()> {
        let indices = self.sgs_indices(sgs)?;
        for idx in 0..self.ext_in.len() {
            let module = self.graph.in_port(self.ext_in[idx].in_port).module;
            if indices.contains(&self.graph.node(module).sg) {
                self.flush_ext_in(idx);
            }
        }
        for idx in 0..self.ext_out.len() {
            let module = self.graph.out_port(self.ext_out[idx].out_port).module;
            if indices.contains(&self.graph.node(module).sg) {
                self.flush_ext_out(idx);
            }
        }
        for m in self.graph.sorted.clone() {
            if !indices.contains(&self.graph.node(m).sg) {
                continue;
            }
            for ip in self.graph.node(m).in_ports.clone() {
                self.graph.in_port_mut(ip).common.reset_data();
            }
            for op in self.graph.node(m).out_ports.clone() {
                self.graph.out_port_mut(op).common.reset_data();
            }
        }
        Ok(())
    }

    fn cmd_graph_close(&mut self, sgs: &[SubgraphId]) -> Result<()> {
        let indices = self.sgs_indices(sgs)?;

        // gap closure: downstream-facing flowing ports get an internal EOS
        // before their queues disappear
        for idx in 0..self.ext_out.len() {
            let op = self.ext_out[idx].out_port;
            let module = self.graph.out_port(op).module;
            if indices.contains(&self.graph.node(module).sg)
                && self.graph.out_port(op).common.data_flow_state
                    == crate::graph::port::DataFlowState::Flowing
            {
                self.ext_out_send_internal_eos(idx);
            }
        }

        // drain pending input messages
        let mut closing_ext_in: Vec<usize> = Vec::new();
        for idx in 0..self.ext_in.len() {
            let module = self.graph.in_port(self.ext_in[idx].in_port).module;
            if indices.contains(&self.graph.node(module).sg) {
                self.flush_ext_in(idx);
                closing_ext_in.push(idx);
            }
        }
        for idx in closing_ext_in.into_iter().rev() {
            self.detach_ext_in(idx);
        }
        let closing_ext_out: Vec<usize> = (0..self.ext_out.len())
            .filter(|&idx| {
                let module = self.graph.out_port(self.ext_out[idx].out_port).module;
                indices.contains(&self.graph.node(module).sg)
            })
            .collect();
        for idx in closing_ext_out.into_iter().rev() {
            self.flush_ext_out(idx);
            self.detach_ext_out(idx);
        }

        // two-phase: mark inside the critical section, reclaim outside
        {
            let critical = self.critical.clone();
            let _guard = critical.lock();
            for sg in &indices {
                self.graph.mark_subgraph_closing(*sg);
            }
        }
        self.graph.purge_closing();
        self.graph.refresh()?;
        self.stm.module = self.graph.stm_module()?;
        self.refresh_stm_active();
        self.recompute_port_states();
        if !self.is_started() {
            self.release_votes();
        }
        debug!("subgraphs closed");
        Ok(())
    }

    fn cmd_connect(
        &mut self,
        from: (ModuleIid, PortId),
        to: (ModuleIid, PortId),
        connect: bool,
    ) -> Result<()> {
        let critical = self.critical.clone();
        let _guard = critical.lock();
        let from_port = self.find_out_port(from.0, from.1)?;
        let to_port = self.find_in_port(to.0, to.1)?;
        if connect {
            self.graph.connect(from_port, to_port)?;
        } else {
            self.graph.disconnect(from_port, to_port)?;
        }
        self.graph.refresh()?;
        Ok(())
    }

    fn cmd_set_cfg(&mut self, module: ModuleIid, param_id: u32, payload: &[u8]) -> Result<()> {
        let m = self
            .graph
            .find_module(module)
            .ok_or_else(|| EngineError::bad_param(format!("unknown module {module}")))?;
        self.graph.procs[m.0].set_param(&mut self.module_events, param_id, payload)?;
        // a raised threshold lands on the module's ports
        if let Some(bytes) = self.module_events.new_threshold_bytes.take() {
            let node = self.graph.node(m);
            let (in_ids, out_ids) = (node.in_ports.clone(), node.out_ports.clone());
            for ip in in_ids {
                self.graph.in_port_mut(ip).common.threshold.raised_bytes = Some(bytes);
            }
            for op in out_ids {
                self.graph.out_port_mut(op).common.threshold.raised_bytes = Some(bytes);
            }
        }
        if let Some(enabled) = self.module_events.new_enabled.take() {
            self.graph.node_mut(m).disabled = !enabled;
        }
        if let Some(inplace) = self.module_events.new_inplace.take() {
            self.graph.node_mut(m).inplace = inplace;
        }
        Ok(())
    }

    fn cmd_get_cfg(&mut self, module: ModuleIid, param_id: u32) -> Result<Vec<u8>> {
        let m = self
            .graph
            .find_module(module)
            .ok_or_else(|| EngineError::bad_param(format!("unknown module {module}")))?;
        self.graph.procs[m.0].get_param(param_id)
    }

    fn cmd_ctrl_media_fmt(&mut self, module: ModuleIid, port: PortId, mf: MediaFormat) -> Result<()> {
        mf.validate()?;
        let ip = self.find_in_port(module, port)?;
        self.graph.in_port_mut(ip).common.media_fmt = Some(mf.clone());
        self.module_events.raise_media_fmt_change();
        self.notify_clients(ClientEvent::MediaFormatChanged { module, mf });
        Ok(())
    }

    fn cmd_inform_icb(
        &mut self,
        module: ModuleIid,
        port: PortId,
        update: FrameLenUpdate,
        real_time: bool,
    ) -> Result<()> {
        let op = self.find_out_port(module, port)?;
        let idx = self
            .graph
            .out_port(op)
            .ext
            .ok_or_else(|| EngineError::bad_param("icb info for a non-external port"))?;
        self.ext_out[idx].downstream_frame = Some(update);
        self.ext_out[idx].downstream_real_time = real_time;
        self.ext_out[idx].icb_dirty = true;
        Ok(())
    }

    fn cmd_peer_property(
        &mut self,
        module: ModuleIid,
        port: PortId,
        property: PeerPortProperty,
    ) -> Result<()> {
        match property {
            PeerPortProperty::UpstreamRealTime(rt) => {
                let ip = self.find_in_port(module, port)?;
                let idx = self
                    .graph
                    .in_port(ip)
                    .ext
                    .ok_or_else(|| EngineError::bad_param("property for a non-external port"))?;
                self.ext_in[idx].upstream_real_time = rt;
                self.module_events.flags |= crate::events::ModuleEventFlags::RT_PROP_CHANGED;
            }
            PeerPortProperty::DownstreamRealTime(rt) => {
                let op = self.find_out_port(module, port)?;
                let idx = self
                    .graph
                    .out_port(op)
                    .ext
                    .ok_or_else(|| EngineError::bad_param("property for a non-external port"))?;
                self.ext_out[idx].downstream_real_time = rt;
                self.ext_out[idx].icb_dirty = true;
                self.module_events.flags |= crate::events::ModuleEventFlags::RT_PROP_CHANGED;
            }
            PeerPortProperty::PortState(state) => {
                if let Ok(op) = self.find_out_port(module, port) {
                    if let Some(idx) = self.graph.out_port(op).ext {
                        self.ext_out[idx].ds_state = state;
                    }
                } else {
                    let ip = self.find_in_port(module, port)?;
                    if let Some(idx) = self.graph.in_port(ip).ext {
                        if state == PortState::Stopped {
                            self.ext_in[idx].upstream_stopped = true;
                            // deliver the gap downstream before the state
                            // downgrade clears the port
                            self.handle_upstream_gap(idx);
                            let _ = self.process_frames(crate::graph::module::TriggerKind::Data);
                        } else if state == PortState::Started {
                            self.ext_in[idx].upstream_stopped = false;
                        }
                        self.ext_in[idx].peer_state = state;
                    }
                }
                self.recompute_port_states();
                self.fwk_events |= FwkEventFlags::PORT_STATE_CHANGED;
            }
        }
        Ok(())
    }

    fn cmd_upstream_stopped(&mut self, module: ModuleIid, port: PortId) -> Result<()> {
        let ip = self.find_in_port(module, port)?;
        let idx = self
            .graph
            .in_port(ip)
            .ext
            .ok_or_else(|| EngineError::bad_param("upstream stop for a non-external port"))?;
        self.ext_in[idx].upstream_stopped = true;
        // synthesize the gap marker and let it travel downstream before the
        // port winds down
        self.handle_upstream_gap(idx);
        let _ = self.process_frames(crate::graph::module::TriggerKind::Data);
        Ok(())
    }

    fn cmd_destroy(&mut self) {
        info!("destroying container");
        self.release_votes();
        for idx in (0..self.ext_in.len()).rev() {
            self.flush_ext_in(idx);
            self.detach_ext_in(idx);
        }
        for idx in (0..self.ext_out.len()).rev() {
            self.flush_ext_out(idx);
            self.detach_ext_out(idx);
        }
        for i in 0..self.graph.subgraphs.len() {
            self.graph.mark_subgraph_closing(crate::graph::module::SgIdx(i));
        }
        self.graph.purge_closing();
        self.terminated = true;
    }

    pub(crate) fn refresh_stm_active(&mut self) {
        let active = self.stm.module.map_or(false, |stm| {
            self.graph.subgraph(self.graph.node(stm).sg).state == PortState::Started
        });
        if self.stm.active && !active {
            self.stop_listen(cadenza_protocol::TIMER_BIT_MASK);
        }
        self.stm.active = active;
    }
}
