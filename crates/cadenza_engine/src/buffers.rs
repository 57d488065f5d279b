//! Per-port channel buffers and inter-container buffering (ICB) sizing.

use cadenza_protocol::{MediaFormat, MetadataItem};
use tracing::warn;

/// One contiguous channel buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkBuf {
    pub data: Vec<u8>,
    pub actual_len: usize,
}

impl ChunkBuf {
    pub fn with_capacity(len: usize) -> Self {
        Self { data: vec![0; len], actual_len: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.actual_len
    }

    pub fn append(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        let at = self.actual_len;
        self.data[at..at + n].copy_from_slice(&src[..n]);
        self.actual_len += n;
        n
    }

    /// Drop the first `n` valid bytes, compacting the remainder to the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.actual_len);
        self.data.copy_within(n..self.actual_len, 0);
        self.actual_len -= n;
    }
}

/// The set of channel buffers owned by one port. All buffers are equal-sized;
/// for unpacked PCM all carry equal `actual_data_len`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelBufs {
    pub bufs: Vec<ChunkBuf>,
    pub max_len_per_buf: usize,
}

impl ChannelBufs {
    pub fn new(num_bufs: usize, max_len_per_buf: usize) -> Self {
        Self {
            bufs: (0..num_bufs).map(|_| ChunkBuf::with_capacity(max_len_per_buf)).collect(),
            max_len_per_buf,
        }
    }

    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn actual_len_per_buf(&self) -> usize {
        self.bufs.first().map(|b| b.actual_len).unwrap_or(0)
    }

    pub fn actual_len_total(&self) -> usize {
        self.bufs.iter().map(|b| b.actual_len).sum()
    }

    pub fn is_allocated(&self) -> bool {
        !self.bufs.is_empty()
    }

    pub fn has_data(&self) -> bool {
        self.actual_len_total() > 0
    }

    pub fn is_full(&self) -> bool {
        self.is_allocated() && self.actual_len_per_buf() >= self.max_len_per_buf
    }

    pub fn clear(&mut self) {
        for b in &mut self.bufs {
            b.actual_len = 0;
        }
    }

    /// Resize to `num_bufs` buffers of `max_len_per_buf` bytes each. Existing
    /// buffers are force-returned; held data is dropped with a warning.
    pub fn resize(&mut self, num_bufs: usize, max_len_per_buf: usize, context: &str) {
        if self.bufs.len() == num_bufs && self.max_len_per_buf == max_len_per_buf {
            return;
        }
        let dropped = self.actual_len_total();
        if dropped > 0 {
            warn!(context, dropped, "buffer resize is dropping held data");
        }
        *self = Self::new(num_bufs, max_len_per_buf);
    }

    pub fn deallocate(&mut self) {
        self.bufs.clear();
        self.max_len_per_buf = 0;
    }
}

/// Flags riding on a port's stream data for one process call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFlags {
    /// The buffer was padded with fill rather than real data.
    pub erasure: bool,
    /// Process boundary forced at the end of this buffer.
    pub eof: bool,
    /// A flushing EOS is inside the module chain at this port.
    pub marker_eos: bool,
    pub ts_valid: bool,
}

/// What a module sees on each of its ports during `process`.
#[derive(Debug, Default)]
pub struct StreamData {
    pub bufs: ChannelBufs,
    pub flags: StreamFlags,
    pub timestamp_us: i64,
    pub metadata: Vec<MetadataItem>,
}

impl StreamData {
    pub fn actual_len_per_buf(&self) -> usize {
        self.bufs.actual_len_per_buf()
    }
}

/// Derive the channel-buffer shape for a port from its media format and the
/// per-buffer length the threshold engine computed.
pub fn buffer_shape(mf: &MediaFormat, max_buf_len_total: usize) -> (usize, usize) {
    let n = mf.num_bufs();
    if n == 0 {
        return (0, 0);
    }
    (n, max_buf_len_total / n)
}

/// Inter-container buffering outcome for one external output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcbResult {
    /// Number of buffers to keep in rotation on the downstream queue.
    pub num_bufs: u32,
    /// Buffers to send as an initial burst once the first frame goes out.
    pub num_prebufs: u32,
}

/// Compute ICB for an output whose frame length is `self_frame_us` feeding a
/// downstream container operating at `downstream_frame_us`. The downstream
/// must be able to hold one of its own frames' worth of our buffers, plus one
/// in flight; real-time downstreams get the surplus pushed up front as
/// prebuffers.
pub fn compute_icb(
    self_frame_us: u64,
    downstream_frame_us: u64,
    downstream_is_real_time: bool,
    max_bufs: u32,
) -> IcbResult {
    let self_frame_us = self_frame_us.max(1);
    let ratio = downstream_frame_us.div_ceil(self_frame_us) as u32;
    let num_bufs = (ratio + 1).clamp(2, max_bufs.max(2));
    let num_prebufs = if downstream_is_real_time { num_bufs - 1 } else { 0 };
    IcbResult { num_bufs, num_prebufs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_protocol::MediaFormat;

    #[test]
    fn append_and_consume() {
        let mut b = ChunkBuf::with_capacity(8);
        assert_eq!(b.append(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(b.append(&[6, 7, 8, 9]), 3);
        assert_eq!(b.actual_len, 8);
        b.consume(5);
        assert_eq!(b.actual_len, 3);
        assert_eq!(&b.data[..3], &[6, 7, 8]);
    }

    #[test]
    fn resize_is_noop_when_shape_unchanged() {
        let mut bufs = ChannelBufs::new(2, 480);
        bufs.bufs[0].append(&[1; 100]);
        bufs.resize(2, 480, "port");
        assert_eq!(bufs.actual_len_per_buf(), 100);
        bufs.resize(2, 960, "port");
        assert_eq!(bufs.actual_len_per_buf(), 0);
        assert_eq!(bufs.max_len_per_buf, 960);
    }

    #[test]
    fn shape_follows_interleaving() {
        let mf = MediaFormat::pcm(2, 48_000, 16);
        assert_eq!(buffer_shape(&mf, 960), (2, 480));
        let mut interleaved = mf.clone();
        interleaved.interleaving = cadenza_protocol::Interleaving::Interleaved;
        assert_eq!(buffer_shape(&interleaved, 960), (1, 960));
    }

    #[test]
    fn icb_bounds() {
        // same rate both sides: double buffering
        assert_eq!(compute_icb(5_000, 5_000, false, 8), IcbResult { num_bufs: 2, num_prebufs: 0 });
        // slow downstream: enough for one downstream frame plus one
        let r = compute_icb(1_000, 5_000, true, 8);
        assert_eq!(r.num_bufs, 6);
        assert_eq!(r.num_prebufs, 5);
        // cap applies
        let r = compute_icb(1_000, 100_000, true, 8);
        assert_eq!(r.num_bufs, 8);
    }
}
