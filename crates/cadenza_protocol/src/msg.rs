//! Data-path messages exchanged over external port queues.
//!
//! Two buffer layouts exist on the wire:
//!
//! - **v1**: a single contiguous payload (interleaved or deinterleaved
//!   packed).
//! - **v2**: a per-channel descriptor table over one backing payload,
//!   identified by bit 0x1000_0000 in the upper nibble of the token.

use crate::error::{ProtocolError, Result};
use crate::media::MediaFormat;
use crate::metadata::MetadataItem;
use crate::{data_msg_token, token_is_v2};
use serde::{Deserialize, Serialize};

/// One channel's view into a v2 payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDesc {
    pub offset: u32,
    pub max_len: u32,
    pub actual_len: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataBuf {
    V1 {
        data: Vec<u8>,
        actual_len: usize,
    },
    V2 {
        data: Vec<u8>,
        channels: Vec<ChannelDesc>,
    },
}

/// A data-buffer message: payload plus per-buffer stream annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMsg {
    pub token: u32,
    pub timestamp_us: Option<i64>,
    pub eof: bool,
    pub metadata: Vec<MetadataItem>,
    pub buf: DataBuf,
}

impl DataMsg {
    /// An empty v1 buffer of the given capacity, as returned by a consumer.
    pub fn empty_v1(capacity: usize) -> Self {
        Self {
            token: data_msg_token(false),
            timestamp_us: None,
            eof: false,
            metadata: Vec::new(),
            buf: DataBuf::V1 { data: vec![0; capacity], actual_len: 0 },
        }
    }

    /// An empty v2 buffer with `num_channels` equal-sized channel regions.
    pub fn empty_v2(num_channels: usize, capacity_per_ch: usize) -> Self {
        let channels = (0..num_channels)
            .map(|ch| ChannelDesc {
                offset: (ch * capacity_per_ch) as u32,
                max_len: capacity_per_ch as u32,
                actual_len: 0,
            })
            .collect();
        Self {
            token: data_msg_token(true),
            timestamp_us: None,
            eof: false,
            metadata: Vec::new(),
            buf: DataBuf::V2 { data: vec![0; num_channels * capacity_per_ch], channels },
        }
    }

    pub fn is_v2(&self) -> bool {
        token_is_v2(self.token)
    }

    /// Total valid bytes across all channels.
    pub fn actual_len_total(&self) -> usize {
        match &self.buf {
            DataBuf::V1 { actual_len, .. } => *actual_len,
            DataBuf::V2 { channels, .. } => {
                channels.iter().map(|c| c.actual_len as usize).sum()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actual_len_total() == 0
    }

    /// Validate the layout against a media format: the token must agree with
    /// the buffer variant, v2 descriptors must match the channel count, stay
    /// inside the payload, and carry equal lengths for unpacked PCM.
    pub fn validate(&self, mf: &MediaFormat) -> Result<()> {
        match &self.buf {
            DataBuf::V1 { data, actual_len } => {
                if *actual_len > data.len() {
                    return Err(ProtocolError::DescriptorOverrun {
                        desc_len: *actual_len,
                        payload_len: data.len(),
                    });
                }
                Ok(())
            }
            DataBuf::V2 { data, channels } => {
                if channels.len() != mf.num_channels as usize {
                    return Err(ProtocolError::DescriptorMismatch {
                        channels: mf.num_channels as usize,
                        descriptors: channels.len(),
                    });
                }
                for c in channels {
                    let end = c.offset as usize + c.max_len as usize;
                    if end > data.len() || c.actual_len > c.max_len {
                        return Err(ProtocolError::DescriptorOverrun {
                            desc_len: end,
                            payload_len: data.len(),
                        });
                    }
                }
                if mf.is_unpacked() {
                    let lens: Vec<usize> =
                        channels.iter().map(|c| c.actual_len as usize).collect();
                    if lens.windows(2).any(|w| w[0] != w[1]) {
                        return Err(ProtocolError::UnequalChannelLengths(lens));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Messages arriving on an external input port's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum InPortMsg {
    Data(DataMsg),
    MediaFormat(MediaFormat),
    /// Forces a process boundary without carrying data.
    Eof,
    UpstreamFrameLen(FrameLenUpdate),
    /// Upstream peer acknowledged a stop; the port will see no more data.
    StopAck,
}

/// Messages the container emits toward a downstream peer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutPortMsg {
    Data(DataMsg),
    MediaFormat(MediaFormat),
    FrameLen(FrameLenUpdate),
}

/// Upstream frame-length change; triggers ICB recalculation downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLenUpdate {
    pub frame_len_us: u64,
    pub frame_len_samples: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaFormat;

    #[test]
    fn empty_v2_layout() {
        let msg = DataMsg::empty_v2(2, 480);
        assert!(msg.is_v2());
        assert!(msg.is_empty());
        match &msg.buf {
            DataBuf::V2 { data, channels } => {
                assert_eq!(data.len(), 960);
                assert_eq!(channels[1].offset, 480);
            }
            _ => panic!("expected v2"),
        }
    }

    #[test]
    fn v2_descriptor_count_must_match_channels() {
        let mf = MediaFormat::pcm(4, 48_000, 16);
        let msg = DataMsg::empty_v2(2, 480);
        assert!(matches!(
            msg.validate(&mf),
            Err(ProtocolError::DescriptorMismatch { channels: 4, descriptors: 2 })
        ));
    }

    #[test]
    fn v2_unequal_lengths_rejected_for_unpacked() {
        let mf = MediaFormat::pcm(2, 48_000, 16);
        let mut msg = DataMsg::empty_v2(2, 480);
        if let DataBuf::V2 { channels, .. } = &mut msg.buf {
            channels[0].actual_len = 100;
            channels[1].actual_len = 96;
        }
        assert!(matches!(
            msg.validate(&mf),
            Err(ProtocolError::UnequalChannelLengths(_))
        ));
    }

    #[test]
    fn v1_overrun_rejected() {
        let mf = MediaFormat::pcm(2, 48_000, 16);
        let msg = DataMsg {
            token: 0,
            timestamp_us: None,
            eof: false,
            metadata: Vec::new(),
            buf: DataBuf::V1 { data: vec![0; 16], actual_len: 32 },
        };
        assert!(msg.validate(&mf).is_err());
    }
}
