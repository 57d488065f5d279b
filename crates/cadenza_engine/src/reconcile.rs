//! Event reconciler: folds pending module and framework events into
//! framework actions after every command and every data-processing step.

use crate::buffers::buffer_shape;
use crate::container::{Container, FrameInfo};
use crate::error::Result;
use crate::events::{FwkEventFlags, ModuleEventFlags};
use crate::graph::module::ModuleProperties;
use crate::threshold;
use cadenza_protocol::{FrameLenUpdate, OutPortMsg};
use tracing::debug;

impl Container {
    /// One reconciliation sweep over snapshots of both flag words. Returns
    /// whether the caller should run a data-processing pass (a trigger
    /// policy or process state changed and staged data may now move).
    pub(crate) fn reconcile_events(&mut self) -> Result<bool> {
        let snap = self.module_events.take();
        let fwk = std::mem::take(&mut self.fwk_events);
        if snap.flags.is_empty() && fwk.is_empty() {
            return Ok(false);
        }

        // any event exits island immediately
        self.exit_island();

        if snap.flags.contains(ModuleEventFlags::MEDIA_FMT_CHANGED) {
            self.propagate_media_formats();
        }

        if snap
            .flags
            .intersects(ModuleEventFlags::MEDIA_FMT_CHANGED | ModuleEventFlags::PORT_THRESH_CHANGED)
            || fwk.contains(FwkEventFlags::FRAME_LEN_CHANGED)
        {
            self.recompute_thresholds_and_buffers()?;
        }

        if snap.flags.contains(ModuleEventFlags::RT_PROP_CHANGED)
            || fwk.contains(FwkEventFlags::ICB_RECALC)
        {
            for p in &mut self.ext_out {
                p.icb_dirty = true;
            }
        }

        if snap.flags.contains(ModuleEventFlags::INPLACE_CHANGED) {
            // inplace chains share buffers; rebuild the chain mapping
            self.graph.refresh()?;
        }

        if snap.flags.contains(ModuleEventFlags::SCRATCH_REALLOC) {
            // scratch arrays are sized with the port buffers
            self.recompute_thresholds_and_buffers()?;
        }

        if snap.flags.contains(ModuleEventFlags::PROCESS_STATE_CHANGED) {
            debug!(enabled = ?snap.new_enabled, "module process state changed");
        }

        // voting: a started container with flowing ports holds a vote;
        // everything else releases
        if snap.flags.contains(ModuleEventFlags::KPPS_BW_CHANGED)
            || fwk.contains(FwkEventFlags::PORT_STATE_CHANGED)
            || fwk.contains(FwkEventFlags::VOTE_RELEASE)
        {
            if self.is_started() && self.any_port_contributing() {
                self.update_kpps_bw(false);
            } else {
                self.release_votes();
            }
        }

        let needs_process_pass = snap.flags.intersects(
            ModuleEventFlags::TRIGGER_POLICY_CHANGED | ModuleEventFlags::PROCESS_STATE_CHANGED,
        );
        Ok(needs_process_pass)
    }

    /// Rerun the threshold engine, resize port buffers to match, inform
    /// modules of changed thresholds and the container frame duration, and
    /// publish frame-length changes downstream.
    pub(crate) fn recompute_thresholds_and_buffers(&mut self) -> Result<()> {
        let outcome = threshold::check_and_propagate(&mut self.graph, &self.cfg)?;
        self.cannot_be_pure_signal_triggered = outcome.cannot_be_pure_signal_triggered;
        let new_frame = FrameInfo { unit: outcome.unit };
        let frame_changed = self.frame != new_frame;
        self.frame = new_frame;

        self.resize_port_buffers();

        // inform modules: pending per-port thresholds and the frame length
        let sorted = self.graph.sorted.clone();
        for m in sorted {
            let node = self.graph.node(m);
            let (in_ids, out_ids) = (node.in_ports.clone(), node.out_ports.clone());
            let mut pending: Option<u64> = None;
            for &ip in &in_ids {
                let t = &mut self.graph.in_port_mut(ip).common.threshold;
                if let Some(b) = t.pending_new_bytes.take() {
                    pending = Some(b);
                }
            }
            for &op in &out_ids {
                let t = &mut self.graph.out_port_mut(op).common.threshold;
                if let Some(b) = t.pending_new_bytes.take() {
                    pending = Some(b);
                }
            }
            if pending.is_some() || frame_changed {
                let props = ModuleProperties {
                    frame_duration_us: Some(self.frame.len_us()),
                    proc_duration_us: Some(self.frame.len_us()),
                    new_threshold_bytes: pending,
                    ..Default::default()
                };
                self.graph.procs[m.0].set_properties(&mut self.module_events, &props)?;
            }
        }

        if frame_changed {
            debug!(frame_us = self.frame.len_us(), "container frame length changed");
            let update = FrameLenUpdate {
                frame_len_us: self.frame.len_us(),
                frame_len_samples: outcome.frame_len_samples(),
            };
            for p in &mut self.ext_out {
                let _ = p.tx.try_send(OutPortMsg::FrameLen(update));
                p.icb_dirty = true;
            }
        }
        Ok(())
    }

    /// Size every port's channel buffers from its effective threshold and
    /// media format, plus any dynamic-mode headroom on the owning module.
    pub(crate) fn resize_port_buffers(&mut self) {
        for i in 0..self.graph.in_ports.len() {
            let module = self.graph.in_ports[i].module;
            let headroom = self.graph.node(module).headroom_bytes_per_ch;
            let common = &mut self.graph.in_ports[i].common;
            let Some(mf) = common.media_fmt.clone() else { continue };
            let total = common.threshold.thresh_bytes as usize;
            if total == 0 {
                continue;
            }
            let (n, per_buf) = buffer_shape(&mf, total);
            common.bufs.resize(n, per_buf + headroom, "in port");
        }
        for i in 0..self.graph.out_ports.len() {
            let module = self.graph.out_ports[i].module;
            let headroom = self.graph.node(module).headroom_bytes_per_ch;
            let common = &mut self.graph.out_ports[i].common;
            let Some(mf) = common.media_fmt.clone() else { continue };
            let total = common.threshold.thresh_bytes as usize;
            if total == 0 {
                continue;
            }
            let (n, per_buf) = buffer_shape(&mf, total);
            common.bufs.resize(n, per_buf + headroom, "out port");
        }
    }
}
