//! External output port I/O: binding empty buffers, filling them, and
//! delivering frames downstream.

use crate::buffers::compute_icb;
use crate::container::{Container, ExtOutFlags, ExtOutPort};
use crate::error::Result;
use crate::graph::module::OutPortId;
use crate::graph::port::{DataFlowState, PortState};
use crate::metadata::MetadataList;
use cadenza_protocol::{DataBuf, DataMsg, OutPortMsg};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

/// Downstream-side endpoints of one external output connection.
pub struct ExtOutConsumer {
    pub data_rx: Receiver<OutPortMsg>,
    /// Return emptied buffers here to keep the rotation going.
    pub buf_tx: Sender<DataMsg>,
}

impl Container {
    pub fn attach_ext_out(
        &mut self,
        out_port: OutPortId,
        tx: Sender<OutPortMsg>,
        buf_rx: Receiver<DataMsg>,
    ) -> Result<usize> {
        let bit_mask = self.alloc_bit()?;
        self.ext_out.push(ExtOutPort {
            out_port,
            bit_mask,
            tx,
            buf_rx,
            held_buf: None,
            md_list: MetadataList::new(),
            flags: ExtOutFlags::default(),
            icb: None,
            icb_dirty: true,
            downstream_frame: None,
            downstream_real_time: false,
            last_sent_mf: None,
            ds_state: PortState::Started,
            overrun_err_count: 0,
            overrun_prepare_buf_err_count: 0,
        });
        let idx = self.ext_out.len() - 1;
        self.graph.out_port_mut(out_port).ext = Some(idx);
        Ok(idx)
    }

    /// Create the downstream channels and register the port.
    pub fn attach_ext_out_channel(&mut self, out_port: OutPortId) -> Result<(ExtOutConsumer, usize)> {
        let depth = self.cfg.data_queue_depth();
        let (data_tx, data_rx) = bounded(depth);
        let (buf_tx, buf_rx) = bounded(depth);
        let idx = self.attach_ext_out(out_port, data_tx, buf_rx)?;
        Ok((ExtOutConsumer { data_rx, buf_tx }, idx))
    }

    pub(crate) fn detach_ext_out(&mut self, idx: usize) {
        let bit = self.ext_out[idx].bit_mask;
        self.free_bit(bit);
        let op = self.ext_out[idx].out_port;
        self.graph.out_port_mut(op).ext = None;
        self.ext_out.remove(idx);
        for (i, p) in self.ext_out.iter().enumerate() {
            let opid = p.out_port;
            self.graph.out_port_mut(opid).ext = Some(i);
        }
    }

    /// Bind returned empties on every started output whose queue has one;
    /// run at the top of each processing pass so the trigger classifier
    /// sees the held buffer.
    pub(crate) fn setup_ready_ext_outputs(&mut self) {
        for idx in 0..self.ext_out.len() {
            let op = self.ext_out[idx].out_port;
            if self.graph.out_port(op).common.state != PortState::Started {
                continue;
            }
            if self.ext_out[idx].held_buf.is_none() {
                if let Ok(buf) = self.ext_out[idx].buf_rx.try_recv() {
                    self.ext_out[idx].held_buf = Some(buf);
                }
            }
        }
    }

    /// Pop an empty buffer from the downstream return queue and bind it.
    /// Returns whether the port holds a buffer afterwards.
    pub(crate) fn ext_out_setup_bufs(&mut self, idx: usize) -> bool {
        if self.ext_out[idx].held_buf.is_some() {
            return true;
        }
        match self.ext_out[idx].buf_rx.try_recv() {
            Ok(buf) => {
                self.ext_out[idx].held_buf = Some(buf);
                true
            }
            Err(_) => {
                if self.stm.active {
                    self.ext_out[idx].overrun_prepare_buf_err_count += 1;
                    if self.err_throttle.should_print() {
                        warn!(
                            idx,
                            overruns = self.ext_out[idx].overrun_prepare_buf_err_count,
                            "no empty buffer at signal trigger"
                        );
                        self.ext_out[idx].overrun_prepare_buf_err_count = 0;
                    }
                }
                false
            }
        }
    }

    /// Recompute ICB from the recorded downstream frame length.
    pub(crate) fn ext_out_update_icb(&mut self, idx: usize) {
        let self_us = self.frame.len_us();
        let Some(ds) = self.ext_out[idx].downstream_frame else {
            return;
        };
        if self_us == 0 {
            return;
        }
        let icb = compute_icb(
            self_us,
            ds.frame_len_us,
            self.ext_out[idx].downstream_real_time,
            self.cfg.max_icb_bufs(),
        );
        if self.ext_out[idx].icb != Some(icb) {
            debug!(idx, ?icb, "icb updated");
            self.ext_out[idx].icb = Some(icb);
        }
        self.ext_out[idx].icb_dirty = false;
    }

    /// Whether the internal port has a complete frame (or forced boundary)
    /// to deliver.
    pub(crate) fn ext_out_ready_to_deliver(&self, idx: usize) -> bool {
        let op = self.ext_out[idx].out_port;
        let common = &self.graph.out_port(op).common;
        if common.state != PortState::Started {
            return false;
        }
        let thresh = common.threshold.thresh_bytes as usize;
        let staged = common.bufs.actual_len_total();
        (thresh > 0 && staged >= thresh)
            || (staged > 0 && common.flags.eof)
            || (!common.md_list.is_empty() && self.process_us_gap)
    }

    /// Fill the held buffer from the internal port and post it downstream.
    pub(crate) fn ext_out_write_data(&mut self, idx: usize) -> Result<()> {
        let op = self.ext_out[idx].out_port;

        self.ext_out_send_pending_media_fmt(idx);

        let Some(mut msg) = self.ext_out[idx].held_buf.take() else {
            return Ok(());
        };

        let (written_total, ts, ts_valid) = {
            let common = &mut self.graph.out_port_mut(op).common;
            let written = fill_msg_from_bufs(&mut msg, common);
            (written, common.timestamp_us, common.flags.ts_valid)
        };

        if ts_valid {
            msg.timestamp_us = Some(ts);
        }
        {
            let common = &mut self.graph.out_port_mut(op).common;
            msg.eof = common.flags.eof;
            common.flags.eof = false;
            let ready = common.md_list.split_off_consumed(written_total as u64);
            let gap_leaving = ready.iter().any(|i| i.is_flushing_eos_or_dfg());
            msg.metadata = ready;
            if gap_leaving {
                common.data_flow_state = DataFlowState::AtGap;
            } else if written_total > 0 {
                common.data_flow_state = DataFlowState::Flowing;
            }
        }

        let first_frame = self.ext_out[idx].last_sent_mf.is_some()
            && !self.ext_out[idx].flags.prebuffers_sent;

        if self.ext_out[idx].tx.try_send(OutPortMsg::Data(msg)).is_err() {
            warn!(idx, "downstream queue full; frame dropped");
        }
        self.proc.anything_changed = true;

        if first_frame {
            self.ext_out_send_prebuffers(idx);
        }
        Ok(())
    }

    fn ext_out_send_pending_media_fmt(&mut self, idx: usize) {
        let op = self.ext_out[idx].out_port;
        let Some(mf) = self.graph.out_port(op).common.media_fmt.clone() else {
            return;
        };
        if self.ext_out[idx].last_sent_mf.as_ref() == Some(&mf) {
            return;
        }
        debug!(idx, "publishing output media format");
        let _ = self.ext_out[idx].tx.try_send(OutPortMsg::MediaFormat(mf.clone()));
        self.ext_out[idx].last_sent_mf = Some(mf);
    }

    /// One-shot initial burst after the first data frame, when the
    /// downstream advertised a real-time need through ICB.
    fn ext_out_send_prebuffers(&mut self, idx: usize) {
        self.ext_out[idx].flags.prebuffers_sent = true;
        let Some(icb) = self.ext_out[idx].icb else { return };
        if icb.num_prebufs == 0 {
            return;
        }
        let op = self.ext_out[idx].out_port;
        let Some(mf) = self.graph.out_port(op).common.media_fmt.clone() else {
            return;
        };
        let frame_bytes = self.graph.out_port(op).common.threshold.thresh_bytes as usize;
        if frame_bytes == 0 {
            return;
        }
        debug!(idx, count = icb.num_prebufs, "sending prebuffers");
        for _ in 0..icb.num_prebufs {
            let mut pre = if mf.num_bufs() > 1 {
                let per_ch = frame_bytes / mf.num_bufs();
                let mut m = DataMsg::empty_v2(mf.num_bufs(), per_ch);
                if let DataBuf::V2 { channels, .. } = &mut m.buf {
                    for c in channels {
                        c.actual_len = per_ch as u32;
                    }
                }
                m
            } else {
                let mut m = DataMsg::empty_v1(frame_bytes);
                if let DataBuf::V1 { actual_len, .. } = &mut m.buf {
                    *actual_len = frame_bytes;
                }
                m
            };
            pre.timestamp_us = None;
            if self.ext_out[idx].tx.try_send(OutPortMsg::Data(pre)).is_err() {
                break;
            }
        }
    }

    /// Signal-triggered overrun after processing: the downstream did not
    /// return a buffer, so this tick's output is dropped.
    pub(crate) fn ext_out_overrun_drop(&mut self, idx: usize) {
        let op = self.ext_out[idx].out_port;
        let common = &mut self.graph.out_port_mut(op).common;
        let dropped = common.bufs.actual_len_total();
        common.bufs.clear();
        let md_dropped = common.md_list.len();
        common.md_list.clear();
        self.ext_out[idx].overrun_err_count += 1;
        if self.err_throttle.should_print() {
            warn!(
                idx,
                dropped,
                md_dropped,
                overruns = self.ext_out[idx].overrun_err_count,
                "overrun: dropping produced data"
            );
            self.ext_out[idx].overrun_err_count = 0;
        }
    }

    /// After a processing pass: deliver completed frames, or account an
    /// overrun on real-time paths.
    pub(crate) fn postprocess_ext_outputs(&mut self) -> Result<()> {
        for idx in 0..self.ext_out.len() {
            if self.ext_out[idx].icb_dirty {
                self.ext_out_update_icb(idx);
            }
            if !self.ext_out_ready_to_deliver(idx) {
                continue;
            }
            if self.ext_out_setup_bufs(idx) {
                self.ext_out_write_data(idx)?;
                self.notify_clients(crate::command::ClientEvent::FrameDone {
                    frame_us: self.frame.len_us(),
                });
            } else if self.stm.active {
                self.ext_out_overrun_drop(idx);
            }
        }
        Ok(())
    }

    /// Return the held buffer downstream empty; used on flush and close.
    pub(crate) fn flush_ext_out(&mut self, idx: usize) {
        if let Some(mut buf) = self.ext_out[idx].held_buf.take() {
            match &mut buf.buf {
                DataBuf::V1 { actual_len, .. } => *actual_len = 0,
                DataBuf::V2 { channels, .. } => {
                    for c in channels {
                        c.actual_len = 0;
                    }
                }
            }
            buf.metadata.clear();
            let _ = self.ext_out[idx].tx.try_send(OutPortMsg::Data(buf));
        }
        let op = self.ext_out[idx].out_port;
        self.graph.out_port_mut(op).common.reset_data();
    }
}

/// Move bytes from the internal port buffers into the outgoing message.
/// Returns total bytes written across channels.
fn fill_msg_from_bufs(msg: &mut DataMsg, common: &mut crate::graph::port::PortCommon) -> usize {
    match &mut msg.buf {
        DataBuf::V1 { data, actual_len } => {
            let nbufs = common.bufs.num_bufs();
            if nbufs <= 1 {
                let src = &mut common.bufs.bufs[0];
                let space = data.len().saturating_sub(*actual_len);
                let n = src.actual_len.min(space);
                data[*actual_len..*actual_len + n].copy_from_slice(&src.data[..n]);
                *actual_len += n;
                src.consume(n);
                n
            } else {
                // unpacked port into a contiguous payload: equal per-channel
                // segments laid out back to back (deinterleaved packed)
                let space_per_ch = (data.len().saturating_sub(*actual_len)) / nbufs;
                let n = common.bufs.actual_len_per_buf().min(space_per_ch);
                let base = *actual_len;
                for b in 0..nbufs {
                    let src = &mut common.bufs.bufs[b];
                    data[base + b * n..base + (b + 1) * n].copy_from_slice(&src.data[..n]);
                    src.consume(n);
                }
                *actual_len += n * nbufs;
                n * nbufs
            }
        }
        DataBuf::V2 { data, channels } => {
            let nbufs = common.bufs.num_bufs().min(channels.len());
            let mut total = 0;
            for (b, desc) in channels.iter_mut().enumerate().take(nbufs) {
                let src = &mut common.bufs.bufs[b];
                let space = (desc.max_len - desc.actual_len) as usize;
                let n = src.actual_len.min(space);
                let start = (desc.offset + desc.actual_len) as usize;
                data[start..start + n].copy_from_slice(&src.data[..n]);
                desc.actual_len += n as u32;
                src.consume(n);
                total += n;
            }
            total
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
    fn fill_v1_consumes_port() {
        let mut common = PortCommon::new(PortId::new(1));
        common.bufs = ChannelBufs::new(1, 8);
        common.bufs.bufs[0].append(&[1, 2, 3, 4, 5, 6]);
        let mut msg = DataMsg::empty_v1(4);
        let n = fill_msg_from_bufs(&mut msg, &mut common);
        assert_eq!(n, 4);
        assert_eq!(msg.actual_len_total(), 4);
        // leftover compacted to front
        assert_eq!(common.bufs.bufs[0].actual_len, 2);
        assert_eq!(&common.bufs.bufs[0].data[..2], &[5, 6]);
    }

    #[test]
    fn fill_v2_per_channel() {
        let mut common = PortCommon::new(PortId::new(1));
        common.bufs = ChannelBufs::new(2, 4);
        common.bufs.bufs[0].append(&[1, 2, 3, 4]);
        common.bufs.bufs[1].append(&[5, 6, 7, 8]);
        let mut msg = DataMsg::empty_v2(2, 4);
        let n = fill_msg_from_bufs(&mut msg, &mut common);
        assert_eq!(n, 8);
        if let DataBuf::V2 { data, channels } = &msg.buf {
            assert_eq!(channels[0].actual_len, 4);
            assert_eq!(&data[..4], &[1, 2, 3, 4]);
            assert_eq!(&data[4..8], &[5, 6, 7, 8]);
        } else {
            panic!("expected v2");
        }
    }
}
