//! Topology process driver: walking the sorted module list and moving data
//! through the graph, plus the pure signal-triggered fast path.
//!
//! Internal connections share buffers: a connected input port reads the
//! upstream output port's buffers directly (the non-buffering chain), so
//! only output ports and external input ports own data.

use crate::buffers::StreamData;
use crate::container::{Container, TriggerVerdict};
use crate::error::Result;
use crate::graph::module::{InPortId, ModuleId, TriggerKind};
use crate::graph::port::{DataFlowState, PortCommon, PortState};
use crate::metadata::propagate_across_process;
use crate::modules::copy_streams;
use tracing::trace;

impl Container {
    /// The data-processing pass driven by one trigger. Repeats until the
    /// trigger selector says to go back to the channel wait; a signal
    /// trigger runs exactly one frame.
    pub(crate) fn process_frames(&mut self, trigger: TriggerKind) -> Result<()> {
        self.proc.curr_trigger = trigger;
        let mut is_entry = true;
        loop {
            // staged-input markers are re-derived every iteration
            for p in &mut self.ext_in {
                p.flags.ready_to_go = false;
            }
            self.preprocess_ext_inputs()?;
            self.setup_ready_ext_outputs();
            if trigger == TriggerKind::Signal && is_entry {
                self.st_check_inputs_and_underrun();
            }
            if self.wait_for_any_trigger(true, is_entry) == TriggerVerdict::WaitForTrigger {
                break;
            }
            is_entry = false;
            self.proc.anything_changed = false;

            if trigger == TriggerKind::Signal && self.is_pure_signal_topology() {
                self.pure_st_process_frame()?;
            } else {
                self.topo_process_one_iteration()?;
            }

            self.postprocess_ext_outputs()?;
            // the synthesized gap marker has had its delivery pass
            self.process_us_gap = false;
            let _ = self.reconcile_events()?;

            if trigger == TriggerKind::Signal {
                if !self.module_events.any() && !self.any_ext_port_at_gap() {
                    self.consider_island_entry();
                }
                break;
            }
        }
        if trigger == TriggerKind::Signal {
            // restore the listen mask for the next wait
            self.wait_for_any_trigger(false, false);
        }
        Ok(())
    }

    pub(crate) fn any_ext_port_at_gap(&self) -> bool {
        self.ext_in.iter().any(|p| {
            self.graph.in_port(p.in_port).common.data_flow_state == DataFlowState::AtGap
        }) || self.ext_out.iter().any(|p| {
            self.graph.out_port(p.out_port).common.data_flow_state == DataFlowState::AtGap
        })
    }

    /// One walk over the sorted module list.
    pub(crate) fn topo_process_one_iteration(&mut self) -> Result<()> {
        let sorted = self.graph.sorted.clone();
        for m in sorted {
            let changed = self.invoke_module(m)?;
            self.proc.anything_changed |= changed;
        }
        Ok(())
    }

    /// Pure signal-triggered fast path: every module threshold matches the
    /// endpoint, no trigger policy is installed, frames are short. One
    /// linear pass, no per-module polling.
    pub(crate) fn pure_st_process_frame(&mut self) -> Result<()> {
        let sorted = self.graph.sorted.clone();
        for m in sorted {
            let changed = self.invoke_module(m)?;
            self.proc.anything_changed |= changed;
        }
        Ok(())
    }

    pub(crate) fn is_pure_signal_topology(&self) -> bool {
        self.stm.module.is_some()
            && self.graph.num_data_tpm() == 0
            && !self.cannot_be_pure_signal_triggered
            && self.frame.len_us() > 0
            && self.frame.len_us() <= 5_000
    }

    /// The port whose buffers back an input: the connected upstream output
    /// inside the container, the input port itself at the boundary.
    fn backing_common_mut(&mut self, ip: InPortId) -> &mut PortCommon {
        match self.graph.in_port(ip).conn {
            Some(op) => &mut self.graph.out_port_mut(op).common,
            None => &mut self.graph.in_port_mut(ip).common,
        }
    }

    /// Hand a module its stream data and run its process step. Returns
    /// whether any bytes or metadata moved.
    fn invoke_module(&mut self, m: ModuleId) -> Result<bool> {
        let node = self.graph.node(m);
        if self.graph.subgraph(node.sg).state != PortState::Started {
            return Ok(false);
        }
        // under a data trigger in a signal-triggered container, only
        // trigger-policy chains process
        if self.proc.curr_trigger == TriggerKind::Data
            && self.stm.active
            && !node.data_trigger_policy_active()
        {
            return Ok(false);
        }
        let is_tpm = node.data_trigger_policy_active();
        let disabled = node.disabled;
        let loops = node.num_proc_loops.max(1);
        let in_ids = node.in_ports.clone();
        let out_ids = node.out_ports.clone();

        // assemble stream data by moving buffers out of the backing ports;
        // ports that are not started offer nothing and keep their buffers
        let mut ins: Vec<StreamData> = Vec::with_capacity(in_ids.len());
        let mut before_in: Vec<usize> = Vec::with_capacity(in_ids.len());
        let mut in_gated: Vec<bool> = Vec::with_capacity(in_ids.len());
        for &ip in &in_ids {
            let gated = self.graph.in_port(ip).common.state == PortState::Started;
            in_gated.push(gated);
            if !gated {
                before_in.push(0);
                ins.push(StreamData::default());
                continue;
            }
            let common = self.backing_common_mut(ip);
            before_in.push(common.bufs.actual_len_per_buf());
            ins.push(StreamData {
                bufs: std::mem::take(&mut common.bufs),
                flags: common.flags,
                timestamp_us: common.timestamp_us,
                metadata: Vec::new(),
            });
        }
        let mut outs: Vec<StreamData> = Vec::with_capacity(out_ids.len());
        let mut produced_before: Vec<usize> = Vec::with_capacity(out_ids.len());
        for &op in &out_ids {
            let common = &mut self.graph.out_port_mut(op).common;
            produced_before.push(common.bufs.actual_len_total());
            outs.push(StreamData {
                bufs: std::mem::take(&mut common.bufs),
                flags: common.flags,
                timestamp_us: common.timestamp_us,
                metadata: Vec::new(),
            });
        }

        let satisfied = !is_tpm
            || self.graph.procs[m.0].is_trigger_satisfied(self.proc.curr_trigger, &ins, &outs);

        let mut consumed_per_in = vec![0usize; in_ids.len()];
        if satisfied {
            for _ in 0..loops {
                let mut moved = false;
                if disabled {
                    // disabled SISO modules are bypassed
                    if ins.len() == 1 && outs.len() == 1 {
                        let (input, output) = (&mut ins[0], &mut outs[0]);
                        let (consumed, produced) = copy_streams(input, output);
                        moved = consumed > 0 || produced > 0;
                        for b in &mut input.bufs.bufs {
                            b.actual_len = consumed.min(b.actual_len);
                        }
                    }
                } else {
                    self.graph.procs[m.0].process(&mut self.module_events, &mut ins, &mut outs)?;
                }
                // contract: input actual_len now holds the consumed amount
                for (i, sd) in ins.iter_mut().enumerate() {
                    let remaining_before = before_in[i] - consumed_per_in[i];
                    let consumed = sd.bufs.actual_len_per_buf().min(remaining_before);
                    if consumed > 0 {
                        moved = true;
                    }
                    // shift out the consumed prefix, restore the remainder
                    for b in &mut sd.bufs.bufs {
                        b.actual_len = remaining_before;
                        b.consume(consumed);
                    }
                    consumed_per_in[i] += consumed;
                }
                if !moved || disabled {
                    break;
                }
            }
        }

        // restore buffers and move metadata by the consumed/produced counts
        let mut changed = false;
        for (i, &ip) in in_ids.iter().enumerate() {
            if !in_gated[i] {
                continue;
            }
            let sd = &mut ins[i];
            let nbufs = sd.bufs.num_bufs().max(1);
            let consumed_total = (consumed_per_in[i] * nbufs) as u64;
            changed |= consumed_total > 0;

            let eof_through = sd.flags.eof && sd.bufs.actual_len_per_buf() == 0;
            let input_now_empty = sd.bufs.actual_len_total() == 0;
            let bufs_back = std::mem::take(&mut sd.bufs);

            let (md_ready, gap_departed) = {
                let common = self.backing_common_mut(ip);
                common.bufs = bufs_back;
                if eof_through {
                    common.flags.eof = false;
                }
                // items inside the consumed prefix move; a gap marker at the
                // head of an empty stream moves too, data or no data
                let take_head = consumed_total == 0
                    && input_now_empty
                    && common.md_list.items().first().map(|i| i.offset == 0).unwrap_or(false);
                let ready = if consumed_total > 0 {
                    common.md_list.split_off_consumed(consumed_total)
                } else if take_head {
                    common.md_list.split_off_consumed(0)
                } else {
                    Vec::new()
                };
                common.flags.marker_eos = common.md_list.has_eos();
                let gap = ready.iter().any(|i| i.is_flushing_eos_or_dfg());
                if gap && input_now_empty {
                    common.data_flow_state = DataFlowState::AtGap;
                }
                (ready, gap)
            };
            if gap_departed {
                changed = true;
            }

            if !md_ready.is_empty() {
                changed = true;
                for (j, &op) in out_ids.iter().enumerate() {
                    let produced_total = outs[j].bufs.actual_len_total();
                    let produced = produced_total.saturating_sub(produced_before[j]) as u64;
                    let mut source = crate::metadata::MetadataList::new();
                    source.extend(md_ready.iter().cloned());
                    let out_common = &mut self.graph.out_port_mut(op).common;
                    propagate_across_process(
                        &mut source,
                        consumed_total.max(source_span(&md_ready)),
                        &mut out_common.md_list,
                        produced_before[j] as u64,
                        produced,
                    );
                    if eof_through {
                        out_common.flags.eof = true;
                    }
                }
            }
        }

        for (j, &op) in out_ids.iter().enumerate() {
            let sd = &mut outs[j];
            let produced_total = sd.bufs.actual_len_total();
            let produced = produced_total.saturating_sub(produced_before[j]);
            changed |= produced > 0;
            let common = &mut self.graph.out_port_mut(op).common;
            common.bufs = std::mem::take(&mut sd.bufs);
            common.flags.erasure = sd.flags.erasure;
            if sd.flags.ts_valid {
                common.flags.ts_valid = true;
                common.timestamp_us = sd.timestamp_us;
            }
            if produced > 0 && common.data_flow_state != DataFlowState::Flowing {
                common.data_flow_state = DataFlowState::Flowing;
            }
        }

        if changed {
            trace!(module = %self.graph.node(m).iid, "module moved data");
        }
        Ok(changed)
    }
}

/// The byte span metadata offsets cover, for scaling when nothing was
/// consumed (gap markers at the head of an empty stream).
fn source_span(items: &[cadenza_protocol::MetadataItem]) -> u64 {
    items.iter().map(|i| i.offset).max().unwrap_or(0)
}
