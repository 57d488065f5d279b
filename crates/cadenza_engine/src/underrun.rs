//! Signal-triggered underrun handling.
//!
//! When the periodic signal fires and an external input has less than the
//! required amount staged, the gap is filled: zeros with the erasure flag
//! for PCM and generic compressed formats, repeating IEC null-burst headers
//! for IEC 60958 non-linear / IEC 61937 streams. On the very first underrun
//! (before processing began) the partial data moves to the end of the buffer
//! and the zero prefix duration is subtracted from the stream timestamp.

use crate::container::Container;
use crate::graph::port::PortState;
use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

/// IEC null-burst header words: pa, pb, pc, pd.
pub const NULL_BURST_WORDS: [u16; 4] = [0xF872, 0x4E1F, 0xE000, 0x0000];

/// Fill a region with repeating null bursts, 8 bytes at a time.
pub fn fill_null_bursts(dst: &mut [u8]) {
    let whole = dst.len() >> 3 << 3;
    for chunk in dst[..whole].chunks_exact_mut(8) {
        for (w, word) in NULL_BURST_WORDS.iter().enumerate() {
            LittleEndian::write_u16(&mut chunk[w * 2..], *word);
        }
    }
}

impl Container {
    /// Fill every started external input up to `bytes_required_per_buf`
    /// before a signal-triggered process pass.
    pub(crate) fn st_check_inputs_and_underrun(&mut self) {
        for idx in 0..self.ext_in.len() {
            let ip = self.ext_in[idx].in_port;
            if self.graph.in_port(ip).common.state != PortState::Started {
                continue;
            }
            let required_total = self.graph.in_port(ip).common.threshold.thresh_bytes as usize;
            let nbufs = self.graph.in_port(ip).common.bufs.num_bufs().max(1);
            let required_per_buf = required_total / nbufs;
            if required_per_buf == 0 {
                continue;
            }
            if self.graph.in_port(ip).common.bufs.actual_len_per_buf() < required_per_buf {
                self.st_underrun(idx, required_per_buf);
            }
        }
    }

    /// Handle one port's underrun. `bytes_required_per_buf` is recomputed by
    /// the caller from the nblc-end requirement.
    pub(crate) fn st_underrun(&mut self, idx: usize, bytes_required_per_buf: usize) {
        let ip = self.ext_in[idx].in_port;
        let nblc_end = self.graph.in_port(ip).nblc_end;
        let end_module = self.graph.in_port(nblc_end).module;
        let data_tp_active = self.graph.node(end_module).data_trigger_policy_active();

        // a trigger-policy module at the chain end may have its own buffered
        // data; only it can call this a true underrun
        if !data_tp_active {
            self.ext_in[idx].underrun_err_count += 1;
            if self.err_throttle.should_print() {
                let common = &self.graph.in_port(ip).common;
                warn!(
                    idx,
                    actual = common.bufs.actual_len_per_buf(),
                    required = bytes_required_per_buf,
                    underruns = self.ext_in[idx].underrun_err_count,
                    "underrun on external input"
                );
                self.ext_in[idx].underrun_err_count = 0;
            }
        }

        let Some(mf) = self.graph.in_port(ip).common.media_fmt.clone() else {
            return;
        };
        let processing_began = self.ext_in[idx].flags.processing_began;
        let common = &mut self.graph.in_port_mut(ip).common;

        if processing_began {
            if mf.data_format.uses_zero_fill() {
                // with a trigger-policy module and partial data, hand the
                // partial data through; the module decides
                if data_tp_active && common.bufs.actual_len_per_buf() != 0 {
                    return;
                }
                for b in &mut common.bufs.bufs {
                    let at = b.actual_len;
                    b.data[at..bytes_required_per_buf].fill(0);
                    b.actual_len = bytes_required_per_buf;
                }
                common.flags.erasure = true;
            } else if mf.data_format.uses_null_burst_fill() {
                let b = &mut common.bufs.bufs[0];
                let at = b.actual_len;
                let max = b.data.len();
                fill_null_bursts(&mut b.data[at..max]);
                b.actual_len = max;
                common.flags.erasure = true;
            }
            // raw compressed and unknown formats: nothing to fill
        } else {
            // first underrun: move partial data to the end, zero the prefix,
            // and back-date the timestamp by the prefix duration
            let mut zeros_per_buf = 0usize;
            if mf.data_format.uses_zero_fill() {
                for b in &mut common.bufs.bufs {
                    let actual = b.actual_len;
                    let max = b.data.len();
                    zeros_per_buf = max - actual;
                    b.data.copy_within(0..actual, zeros_per_buf);
                    b.data[..zeros_per_buf].fill(0);
                    b.actual_len = max;
                }
                common.flags.erasure = false;
            } else if mf.data_format.uses_null_burst_fill() {
                let b = &mut common.bufs.bufs[0];
                let at = b.actual_len;
                let max = b.data.len();
                zeros_per_buf = max - at;
                fill_null_bursts(&mut b.data[at..max]);
                b.actual_len = max;
                common.flags.erasure = true;
            } else {
                warn!(idx, "underrun fill not defined for this data format");
            }

            if mf.data_format.is_packetized_or_pcm() && common.flags.ts_valid {
                let adjust = if mf.is_unpacked() {
                    mf.bytes_per_ch_to_us(zeros_per_buf as u64)
                } else {
                    mf.bytes_to_us(zeros_per_buf as u64)
                };
                common.timestamp_us -= adjust as i64;
            }
        }
        self.proc.anything_changed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_burst_pattern() {
        let mut buf = [0u8; 16];
        fill_null_bursts(&mut buf);
        assert_eq!(LittleEndian::read_u16(&buf[0..]), 0xF872);
        assert_eq!(LittleEndian::read_u16(&buf[2..]), 0x4E1F);
        assert_eq!(LittleEndian::read_u16(&buf[4..]), 0xE000);
        assert_eq!(LittleEndian::read_u16(&buf[6..]), 0x0000);
        assert_eq!(LittleEndian::read_u16(&buf[8..]), 0xF872);
    }

    #[test]
    fn null_burst_writes_whole_multiples_of_eight() {
        let mut buf = [0xAAu8; 12];
        fill_null_bursts(&mut buf);
        // the 4-byte tail is untouched
        assert_eq!(&buf[8..], &[0xAA; 4]);
    }
}
