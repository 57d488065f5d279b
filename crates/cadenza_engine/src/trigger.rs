//! Trigger selection: deciding which external signals to wait on and when
//! processing may continue.

use crate::container::{Container, TriggerVerdict};
use crate::graph::module::{ModuleFlags, ModuleId, TriggerKind};
use crate::graph::port::{DataFlowState, NonTriggerPolicy, PortState};
use crate::graph::OutPortId;
use tracing::trace;

/// Classification of an external input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataNeed {
    Blocked,
    NotNeeded,
    Needed,
    Optional,
}

/// Classification of an external output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerNeed {
    NotNeeded,
    Needed,
    Optional,
}

impl Container {
    /// When EOS is stuck inside module algos the marker is set even though
    /// the list doesn't carry the item, and vice versa; check both.
    pub fn ext_in_has_flushing_eos_dfg(&self, idx: usize) -> bool {
        let common = &self.graph.in_port(self.ext_in[idx].in_port).common;
        common.flags.marker_eos || common.md_list.has_flushing_eos_or_dfg()
    }

    /// Under an active signal trigger, data triggers reach only modules with
    /// an active data trigger policy.
    fn module_data_trigger_allowed(&self, m: ModuleId) -> bool {
        !self.stm.active || self.graph.node(m).data_trigger_policy_active()
    }

    /// Read-only view of the port whose buffers back an input.
    fn in_backing_common(&self, ip: crate::graph::module::InPortId) -> &crate::graph::port::PortCommon {
        match self.graph.in_port(ip).conn {
            Some(op) => &self.graph.out_port(op).common,
            None => &self.graph.in_port(ip).common,
        }
    }

    fn int_in_port_needs_data(&self, idx: usize) -> DataNeed {
        let ip = self.ext_in[idx].in_port;
        let port = self.graph.in_port(ip);
        if port.common.state != PortState::Started {
            return DataNeed::Blocked;
        }
        let nblc_end = port.nblc_end;
        let end_port = self.graph.in_port(nblc_end);
        if port.common.nontrigger_policy == NonTriggerPolicy::Blocked
            || end_port.common.nontrigger_policy == NonTriggerPolicy::Blocked
        {
            return DataNeed::Blocked;
        }
        if !self.module_data_trigger_allowed(end_port.module) {
            return DataNeed::Blocked;
        }
        let thresh = port.common.threshold.thresh_bytes as usize;
        if thresh > 0 && port.common.bufs.actual_len_total() >= thresh {
            return DataNeed::NotNeeded;
        }
        // data already staged at the chain end counts: the downstream module
        // has a full frame waiting even though the boundary buffer drained
        let end_backing = self.in_backing_common(nblc_end);
        let end_thresh = end_backing.threshold.thresh_bytes as usize;
        if end_thresh > 0 && end_backing.bufs.actual_len_total() >= end_thresh {
            return DataNeed::NotNeeded;
        }
        DataNeed::Needed
    }

    pub fn ext_in_needs_data(&self, idx: usize) -> DataNeed {
        let rc = self.int_in_port_needs_data(idx);
        if rc == DataNeed::Blocked {
            return rc;
        }
        // a held message (data or media format) must be consumed before
        // waiting for more input
        if self.ext_in[idx].held.is_some() {
            return DataNeed::NotNeeded;
        }
        // with flushing EOS present, input is optional: more data may turn
        // the EOS non-flushing
        if self.ext_in_has_flushing_eos_dfg(idx) {
            return DataNeed::Optional;
        }
        rc
    }

    /// A chain ending in a disabled source with every intermediate port at
    /// gap must not be waited on; the enable event is the next trigger.
    fn connected_src_module_path_drained(&self, out_port: OutPortId) -> bool {
        let port = self.graph.out_port(out_port);
        if port.common.data_flow_state == DataFlowState::Flowing {
            return false;
        }
        let start = self.graph.out_port(port.nblc_start);
        let start_node = self.graph.node(start.module);
        if start_node.is_source() && start_node.disabled {
            return true;
        }
        if start_node.in_ports.len() == 1 {
            if let Some(prev_out) = self.graph.in_port(start_node.in_ports[0]).conn {
                return self.connected_src_module_path_drained(prev_out);
            }
        }
        false
    }

    fn ext_out_needs_to_be_waited_on(&self, idx: usize) -> TriggerNeed {
        let p = &self.ext_out[idx];
        let port = self.graph.out_port(p.out_port);

        // port state and the downstream-informed downgraded state can differ
        // when the boundary module blocks propagation; both must be started
        if port.common.state != PortState::Started || p.ds_state != PortState::Started {
            return TriggerNeed::NotNeeded;
        }
        if !self.module_data_trigger_allowed(port.module) {
            return TriggerNeed::NotNeeded;
        }
        let ntp = port.common.nontrigger_policy;
        if p.held_buf.is_some() || ntp == NonTriggerPolicy::Blocked {
            return TriggerNeed::NotNeeded;
        }

        let nblc_start = port.nblc_start;
        if nblc_start != p.out_port {
            let start_port = self.graph.out_port(nblc_start);
            if !self.module_data_trigger_allowed(start_port.module) {
                return TriggerNeed::NotNeeded;
            }
            let start_ntp = start_port.common.nontrigger_policy;
            if start_ntp == NonTriggerPolicy::Blocked {
                return TriggerNeed::NotNeeded;
            }
            if self.graph.any_source_module()
                && self.connected_src_module_path_drained(p.out_port)
            {
                return TriggerNeed::NotNeeded;
            }
            if start_ntp == NonTriggerPolicy::Optional {
                return TriggerNeed::Optional;
            }
        } else if self.graph.any_source_module()
            && self.connected_src_module_path_drained(p.out_port)
        {
            return TriggerNeed::NotNeeded;
        }

        if ntp == NonTriggerPolicy::Optional {
            TriggerNeed::Optional
        } else {
            TriggerNeed::Needed
        }
    }

    /// The trigger selector. Returns whether the caller may continue
    /// processing or must go back to the channel wait. Rebuilds the per-path
    /// wait masks and the listen mask as a side effect.
    pub fn wait_for_any_trigger(
        &mut self,
        called_from_process_context: bool,
        is_entry: bool,
    ) -> TriggerVerdict {
        use TriggerVerdict::*;

        self.proc.probing_for_tpm_activity = false;
        let num_paths = self.graph.num_parallel_paths.max(1);
        self.wait_mask_arr = vec![0; num_paths];

        let num_data_tpm = self.graph.num_data_tpm();

        if num_data_tpm > 0 {
            if is_entry {
                return ContinueProcessing;
            }
        } else if self.stm.active {
            // signal-triggered with no data trigger policy: run at entry,
            // listen only to the periodic signal otherwise
            if is_entry {
                return ContinueProcessing;
            }
            if self.proc.curr_trigger != TriggerKind::Signal {
                let stop = self.all_ext_in_mask() | self.all_ext_out_mask();
                self.stop_listen(stop);
            }
            return WaitForTrigger;
        }

        // after a processing pass with trigger-policy modules, transition to
        // data trigger before probing, else signal-trigger underruns keep
        // anything_changed true forever
        if !is_entry && num_data_tpm > 0 && self.proc.anything_changed {
            self.proc.curr_trigger = TriggerKind::Data;
            if num_paths == 1 {
                self.proc.probing_for_tpm_activity = true;
            }
        }

        let mut in_wait_mask = 0u32;
        let mut out_wait_mask = 0u32;
        let mut stop_mask = 0u32;
        let mut optional_wait_mask = 0u32;
        let mut force_wait_for_trigger = false;

        let mut at_least_one_in_tpm = false;
        let mut num_ext_in_tpm_ready_to_process = 0u32;
        for idx in 0..self.ext_in.len() {
            let bit = self.ext_in[idx].bit_mask;
            let ip = self.ext_in[idx].in_port;
            let is_input_data_tpm = if self.proc.probing_for_tpm_activity {
                let end = self.graph.in_port(self.graph.in_port(ip).nblc_end);
                let end_node = self.graph.node(end.module);
                let tpm = end_node.data_trigger_policy_active()
                    && (!self.stm.active
                        || end_node.flags.contains(ModuleFlags::INPUT_DATA_TRIGGER_IN_ST));
                if tpm {
                    at_least_one_in_tpm = true;
                }
                tpm
            } else {
                false
            };

            let need = if self.ext_in[idx].flags.ready_to_go {
                DataNeed::NotNeeded
            } else {
                self.ext_in_needs_data(idx)
            };
            trace!(idx, ?need, bit, "ext in classified");

            match need {
                DataNeed::NotNeeded => {
                    stop_mask |= bit;
                    if is_input_data_tpm {
                        num_ext_in_tpm_ready_to_process += 1;
                    }
                }
                DataNeed::Blocked => stop_mask |= bit,
                DataNeed::Needed => {
                    in_wait_mask |= bit;
                    let path = self.graph.node(self.graph.in_port(ip).module).path_index;
                    self.wait_mask_arr[path] |= bit;
                }
                DataNeed::Optional => {
                    optional_wait_mask |= bit;
                    if is_input_data_tpm {
                        num_ext_in_tpm_ready_to_process += 1;
                    }
                }
            }
        }

        // if every input-side trigger-policy module is starved there is no
        // point probing; wait even if an optional path is free
        if at_least_one_in_tpm && self.proc.probing_for_tpm_activity {
            if num_ext_in_tpm_ready_to_process == 0 {
                force_wait_for_trigger = true;
            } else {
                return ContinueProcessing;
            }
        }

        let mut at_least_one_out_tpm = false;
        let mut num_ext_out_tpm_ready_to_process_data = 0u32;
        for idx in 0..self.ext_out.len() {
            let bit = self.ext_out[idx].bit_mask;
            let op = self.ext_out[idx].out_port;
            let is_output_data_tpm = if self.proc.probing_for_tpm_activity {
                let start = self.graph.out_port(self.graph.out_port(op).nblc_start);
                let start_node = self.graph.node(start.module);
                let tpm = start_node.data_trigger_policy_active()
                    && (!self.stm.active
                        || start_node.flags.contains(ModuleFlags::OUTPUT_DATA_TRIGGER_IN_ST));
                if tpm {
                    at_least_one_out_tpm = true;
                }
                tpm
            } else {
                false
            };

            let need = self.ext_out_needs_to_be_waited_on(idx);
            trace!(idx, ?need, bit, "ext out classified");

            match need {
                TriggerNeed::Needed => {
                    out_wait_mask |= bit;
                    let path = self.graph.node(self.graph.out_port(op).module).path_index;
                    self.wait_mask_arr[path] |= bit;
                }
                TriggerNeed::Optional => {
                    optional_wait_mask |= bit;
                    if is_output_data_tpm {
                        num_ext_out_tpm_ready_to_process_data += 1;
                    }
                }
                TriggerNeed::NotNeeded => {
                    if is_output_data_tpm {
                        let start = self.graph.out_port(self.graph.out_port(op).nblc_start);
                        if start.common.nontrigger_policy != NonTriggerPolicy::Blocked {
                            num_ext_out_tpm_ready_to_process_data += 1;
                        }
                    }
                    stop_mask |= bit;
                }
            }
        }

        if at_least_one_out_tpm && self.proc.probing_for_tpm_activity {
            if num_ext_out_tpm_ready_to_process_data == 0 {
                force_wait_for_trigger = true;
            } else {
                return ContinueProcessing;
            }
        }

        let wait_mask = if num_data_tpm == 0 {
            // waiting on outputs before inputs avoids buffering delay at the
            // external input while the output is absent
            let mut mask = 0u32;
            for path in 0..num_paths {
                let iw = in_wait_mask & self.wait_mask_arr[path];
                let ow = out_wait_mask & self.wait_mask_arr[path];
                mask |= if ow != 0 { ow } else { iw };
            }
            mask
        } else {
            in_wait_mask | out_wait_mask
        };

        self.start_listen(wait_mask | optional_wait_mask);
        self.stop_listen(stop_mask);

        if force_wait_for_trigger {
            return WaitForTrigger;
        }

        if called_from_process_context && !is_entry {
            if self.proc.anything_changed {
                if num_data_tpm > 0 {
                    // something changed; every module gets another chance
                    for m in &mut self.wait_mask_arr {
                        *m = 0;
                    }
                    return ContinueProcessing;
                }
            } else {
                // nothing changed; exiting avoids an infinite process loop
                return WaitForTrigger;
            }
        }

        if wait_mask == 0 {
            ContinueProcessing
        } else if self.is_any_path_ready_to_process() {
            ContinueProcessing
        } else {
            WaitForTrigger
        }
    }

    pub fn is_any_path_ready_to_process(&self) -> bool {
        self.wait_mask_arr.iter().any(|&m| m == 0)
    }
}
