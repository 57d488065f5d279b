//! External input port I/O: pumping queue messages into internal buffers.

use crate::container::{Container, ExtInFlags, ExtInPort};
use crate::error::Result;
use crate::events::FwkEventFlags;
use crate::graph::module::InPortId;
use crate::graph::port::{DataFlowState, PortState};
use crate::metadata::blocks_media_format;
use cadenza_protocol::{DataBuf, DataMsg, InPortMsg, MediaFormat};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

impl Container {
    /// Register an external input port over the given queue receiver,
    /// claiming a channel bit.
    pub fn attach_ext_in(&mut self, in_port: InPortId, rx: Receiver<InPortMsg>) -> Result<usize> {
        let bit_mask = self.alloc_bit()?;
        self.ext_in.push(ExtInPort {
            in_port,
            bit_mask,
            rx,
            held: None,
            pending_mf: None,
            flags: ExtInFlags::default(),
            upstream_frame_len: None,
            upstream_stopped: false,
            upstream_real_time: false,
            peer_state: crate::graph::port::PortState::Started,
            flush_eos_cnt: 0,
            underrun_err_count: 0,
        });
        let idx = self.ext_in.len() - 1;
        self.graph.in_port_mut(in_port).ext = Some(idx);
        Ok(idx)
    }

    /// Convenience for in-process peers: create the bounded queue and return
    /// the producer side.
    pub fn attach_ext_in_channel(&mut self, in_port: InPortId) -> Result<(Sender<InPortMsg>, usize)> {
        let (tx, rx) = bounded(self.cfg.data_queue_depth());
        let idx = self.attach_ext_in(in_port, rx)?;
        Ok((tx, idx))
    }

    pub(crate) fn detach_ext_in(&mut self, idx: usize) {
        let bit = self.ext_in[idx].bit_mask;
        self.free_bit(bit);
        let ip = self.ext_in[idx].in_port;
        self.graph.in_port_mut(ip).ext = None;
        self.ext_in.remove(idx);
        for (i, p) in self.ext_in.iter().enumerate() {
            let ipid = p.in_port;
            self.graph.in_port_mut(ipid).ext = Some(i);
        }
    }

    /// Pump every started external input: move queue messages into the
    /// port's internal buffers until the threshold amount is staged or the
    /// queue runs dry.
    pub(crate) fn preprocess_ext_inputs(&mut self) -> Result<()> {
        for idx in 0..self.ext_in.len() {
            let ip = self.ext_in[idx].in_port;
            if self.graph.in_port(ip).common.state != PortState::Started {
                continue;
            }
            self.ext_in_on_trigger(idx)?;
        }
        Ok(())
    }

    pub(crate) fn ext_in_on_trigger(&mut self, idx: usize) -> Result<()> {
        loop {
            let ip = self.ext_in[idx].in_port;

            // a media format held back for in-flight metadata applies once
            // the port has fully drained
            if let Some(mf) = self.ext_in[idx].pending_mf.clone() {
                let common = &self.graph.in_port(ip).common;
                if common.bufs.has_data() || blocks_media_format(&common.md_list) {
                    break;
                }
                self.ext_in[idx].pending_mf = None;
                self.apply_input_media_format(idx, mf)?;
            }

            let thresh = {
                let common = &self.graph.in_port(ip).common;
                common.threshold.thresh_bytes as usize
            };
            let staged = self.graph.in_port(ip).common.bufs.actual_len_total();
            if thresh > 0 && staged >= thresh {
                self.ext_in[idx].flags.ready_to_go = true;
                break;
            }

            if self.ext_in[idx].held.is_none() {
                match self.ext_in[idx].rx.try_recv() {
                    Ok(msg) => self.ext_in[idx].held = Some(msg),
                    Err(_) => break,
                }
            }

            let msg = self.ext_in[idx].held.take().expect("held message");
            match msg {
                InPortMsg::MediaFormat(mf) => {
                    if !self.ext_in_accept_media_format(idx, mf)? {
                        break;
                    }
                }
                InPortMsg::Data(data) => {
                    if !self.ext_in_copy_data(idx, data)? {
                        break;
                    }
                }
                InPortMsg::Eof => {
                    self.graph.in_port_mut(ip).common.flags.eof = true;
                    self.proc.anything_changed = true;
                }
                InPortMsg::UpstreamFrameLen(update) => {
                    self.ext_in[idx].upstream_frame_len = Some(update);
                    self.fwk_events |= FwkEventFlags::ICB_RECALC;
                }
                InPortMsg::StopAck => {
                    self.ext_in[idx].upstream_stopped = true;
                    self.handle_upstream_gap(idx);
                }
            }
        }
        Ok(())
    }

    /// Returns false when the message had to be held back.
    fn ext_in_accept_media_format(&mut self, idx: usize, mf: MediaFormat) -> Result<bool> {
        mf.validate()?;
        let ip = self.ext_in[idx].in_port;
        let has_data = self.graph.in_port(ip).common.bufs.has_data();

        if self.stm.active {
            // signal-triggered: no concatenation across format boundaries
            if has_data {
                let dropped = self.graph.in_port(ip).common.bufs.actual_len_total();
                warn!(idx, dropped, "format boundary: dropping buffered input");
                self.graph.in_port_mut(ip).common.bufs.clear();
                self.ext_in[idx].flags.input_discontinuity = true;
            }
            self.apply_input_media_format(idx, mf)?;
            return Ok(true);
        }

        let md_busy = blocks_media_format(&self.graph.in_port(ip).common.md_list);
        if has_data || md_busy {
            // in-band boundary: force a process boundary, apply after drain
            self.graph.in_port_mut(ip).common.flags.eof = true;
            self.ext_in[idx].pending_mf = Some(mf);
            self.proc.anything_changed = true;
            return Ok(false);
        }
        self.apply_input_media_format(idx, mf)?;
        Ok(true)
    }

    pub(crate) fn apply_input_media_format(&mut self, idx: usize, mf: MediaFormat) -> Result<()> {
        let ip = self.ext_in[idx].in_port;
        debug!(idx, sample_rate = mf.sample_rate, channels = mf.num_channels, "input media format");
        self.graph.in_port_mut(ip).common.media_fmt = Some(mf.clone());
        self.module_events.raise_media_fmt_change();
        self.notify_clients(crate::command::ClientEvent::MediaFormatChanged {
            module: self.graph.node(self.graph.in_port(ip).module).iid,
            mf,
        });
        Ok(())
    }

    /// Copy as much of a data message as fits. Returns true when the message
    /// was fully consumed; otherwise it is held for the next pull.
    fn ext_in_copy_data(&mut self, idx: usize, mut msg: DataMsg) -> Result<bool> {
        let ip = self.ext_in[idx].in_port;
        let Some(mf) = self.graph.in_port(ip).common.media_fmt.clone() else {
            warn!(idx, "data before media format; dropping message");
            return Ok(true);
        };
        if let Err(e) = msg.validate(&mf) {
            warn!(idx, error = %e, "malformed data message dropped");
            return Ok(true);
        }
        if !self.graph.in_port(ip).common.bufs.is_allocated() {
            // buffers appear at prepare; hold until then
            self.ext_in[idx].held = Some(InPortMsg::Data(msg));
            return Ok(false);
        }

        let port_empty = !self.graph.in_port(ip).common.bufs.has_data();
        if port_empty {
            if let Some(ts) = msg.timestamp_us {
                let common = &mut self.graph.in_port_mut(ip).common;
                common.timestamp_us = ts;
                common.flags.ts_valid = true;
            }
        }

        // metadata transfers on first copy, rebased onto the staged stream
        if !msg.metadata.is_empty() {
            let base = self.graph.in_port(ip).common.bufs.actual_len_total() as u64;
            let clamp = msg.actual_len_total() as u64;
            let items = std::mem::take(&mut msg.metadata);
            self.ext_in[idx].flush_eos_cnt +=
                items.iter().filter(|i| i.is_flushing_eos()).count() as u32;
            self.graph.in_port_mut(ip).common.md_list.append_rebased(items, base, clamp);
        }

        let fully = {
            let common = &mut self.graph.in_port_mut(ip).common;
            copy_msg_into_bufs(&mut msg, common)
        };

        if self.graph.in_port(ip).common.bufs.has_data() {
            let common = &mut self.graph.in_port_mut(ip).common;
            if common.data_flow_state != DataFlowState::Flowing {
                common.data_flow_state = DataFlowState::Flowing;
                self.fwk_events |= FwkEventFlags::PORT_STATE_CHANGED;
            }
            self.proc.anything_changed = true;
        }

        if fully {
            if msg.eof {
                self.graph.in_port_mut(ip).common.flags.eof = true;
            }
            self.ext_in[idx].flags.processing_began = true;
            Ok(true)
        } else {
            self.ext_in[idx].held = Some(InPortMsg::Data(msg));
            Ok(false)
        }
    }

    /// Drain and drop everything pending on an external input; used on flush
    /// and on close.
    pub(crate) fn flush_ext_in(&mut self, idx: usize) {
        let mut dropped = 0usize;
        if let Some(msg) = self.ext_in[idx].held.take() {
            if matches!(msg, InPortMsg::Data(_)) {
                dropped += 1;
            }
        }
        while let Ok(msg) = self.ext_in[idx].rx.try_recv() {
            if matches!(msg, InPortMsg::Data(_)) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.ext_in[idx].flags.input_discontinuity = true;
            debug!(idx, dropped, "flushed input data messages");
        }
        self.ext_in[idx].pending_mf = None;
        self.ext_in[idx].flags.ready_to_go = false;
        let ip = self.ext_in[idx].in_port;
        self.graph.in_port_mut(ip).common.reset_data();
    }
}

/// Copy message payload into the port's channel buffers. Mutates the message
/// to account for partially copied bytes. Returns true when nothing is left.
fn copy_msg_into_bufs(msg: &mut DataMsg, common: &mut crate::graph::port::PortCommon) -> bool {
    match &mut msg.buf {
        DataBuf::V1 { data, actual_len } => {
            let nbufs = common.bufs.num_bufs();
            if nbufs <= 1 {
                let n = common.bufs.bufs[0].append(&data[..*actual_len]);
                data.drain(..n);
                *actual_len -= n;
                *actual_len == 0
            } else {
                // contiguous payload carrying equal per-channel segments
                let per_ch = *actual_len / nbufs;
                let space = common.bufs.bufs[0].remaining();
                let n = per_ch.min(space);
                for b in 0..nbufs {
                    let start = b * per_ch;
                    let seg = data[start..start + n].to_vec();
                    common.bufs.bufs[b].append(&seg);
                }
                // drop copied prefix of each segment
                let mut rest = Vec::with_capacity(*actual_len - n * nbufs);
                for b in 0..nbufs {
                    rest.extend_from_slice(&data[b * per_ch + n..(b + 1) * per_ch]);
                }
                *data = rest;
                *actual_len -= n * nbufs;
                *actual_len == 0
            }
        }
        DataBuf::V2 { data, channels } => {
            let nbufs = common.bufs.num_bufs().min(channels.len());
            let mut all_done = true;
            let mut n_common = usize::MAX;
            for (b, desc) in channels.iter().enumerate().take(nbufs) {
                let avail = desc.actual_len as usize;
                let space = common.bufs.bufs[b].remaining();
                n_common = n_common.min(avail.min(space));
            }
            if n_common == usize::MAX {
                n_common = 0;
            }
            for (b, desc) in channels.iter_mut().enumerate().take(nbufs) {
                let start = desc.offset as usize;
                let seg = data[start..start + n_common].to_vec();
                common.bufs.bufs[b].append(&seg);
                desc.offset += n_common as u32;
                desc.actual_len -= n_common as u32;
                desc.max_len -= n_common as u32;
                if desc.actual_len > 0 {
                    all_done = false;
                }
            }
            all_done
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::ChannelBufs;
    use crate::graph::port::PortCommon;
    use cadenza_protocol::PortId;

    #[test]
    fn v1_partial_copy_is_held() {
        let mut common = PortCommon::new(PortId::new(2));
        common.bufs = ChannelBufs::new(1, 4);
        let mut msg = DataMsg::empty_v1(8);
        if let DataBuf::V1 { data, actual_len } = &mut msg.buf {
            data.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
            *actual_len = 8;
        }
        assert!(!copy_msg_into_bufs(&mut msg, &mut common));
        assert_eq!(common.bufs.bufs[0].actual_len, 4);
        assert_eq!(msg.actual_len_total(), 4);
        common.bufs.clear();
        assert!(copy_msg_into_bufs(&mut msg, &mut common));
        assert_eq!(&common.bufs.bufs[0].data[..4], &[5, 6, 7, 8]);
    }

    #[test]
    fn v2_copies_per_channel() {
        let mut common = PortCommon::new(PortId::new(2));
        common.bufs = ChannelBufs::new(2, 4);
        let mut msg = DataMsg::empty_v2(2, 4);
        if let DataBuf::V2 { data, channels } = &mut msg.buf {
            data.copy_from_slice(&[1, 2, 3, 4, 9, 9, 9, 9]);
            channels[0].actual_len = 4;
            channels[1].actual_len = 4;
        }
        assert!(copy_msg_into_bufs(&mut msg, &mut common));
        assert_eq!(&common.bufs.bufs[0].data[..4], &[1, 2, 3, 4]);
        assert_eq!(&common.bufs.bufs[1].data[..4], &[9, 9, 9, 9]);
    }
}
