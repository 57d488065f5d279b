//! Metadata items that travel with sample bytes.
//!
//! Each item is ordered relative to the data stream by a byte offset. The
//! engine keeps per-port lists sorted by that offset and shifts offsets as
//! bytes are consumed; here we only define the item itself.

use crate::media::MediaFormat;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EosFlags {
    /// Flushing EOS forces downstream to drain; non-flushing does not.
    pub is_flushing: bool,
    /// Set when the container synthesized the EOS (peer stop, close) rather
    /// than receiving it from upstream.
    pub is_internal: bool,
}

/// Optional client-visible tracking handle on an EOS, used to report
/// rendered/dropped disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EosTracking {
    pub source_module: u32,
    pub token: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataKind {
    Eos { flags: EosFlags, tracking: Option<EosTracking> },
    /// Data-flow gap: a pause in data flow, non-terminal.
    Dfg,
    /// End of frame: forces a process boundary.
    Eof,
    MediaFormat(MediaFormat),
    TimestampDiscontinuity { ts_valid: bool, disc_us: i64 },
    Client { param_id: u32, payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataItem {
    /// Byte offset into the stream at which this item applies.
    pub offset: u64,
    pub kind: MetadataKind,
}

impl MetadataItem {
    pub fn new(offset: u64, kind: MetadataKind) -> Self {
        Self { offset, kind }
    }

    pub fn flushing_eos(offset: u64) -> Self {
        Self::new(
            offset,
            MetadataKind::Eos {
                flags: EosFlags { is_flushing: true, is_internal: false },
                tracking: None,
            },
        )
    }

    pub fn internal_flushing_eos(offset: u64) -> Self {
        Self::new(
            offset,
            MetadataKind::Eos {
                flags: EosFlags { is_flushing: true, is_internal: true },
                tracking: None,
            },
        )
    }

    pub fn dfg(offset: u64) -> Self {
        Self::new(offset, MetadataKind::Dfg)
    }

    pub fn is_flushing_eos(&self) -> bool {
        matches!(self.kind, MetadataKind::Eos { flags, .. } if flags.is_flushing)
    }

    pub fn is_eos(&self) -> bool {
        matches!(self.kind, MetadataKind::Eos { .. })
    }

    pub fn is_dfg(&self) -> bool {
        matches!(self.kind, MetadataKind::Dfg)
    }

    /// Items that mark a data-flow gap: flushing EOS or DFG.
    pub fn is_flushing_eos_or_dfg(&self) -> bool {
        self.is_flushing_eos() || self.is_dfg()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_markers() {
        assert!(MetadataItem::flushing_eos(0).is_flushing_eos_or_dfg());
        assert!(MetadataItem::dfg(16).is_flushing_eos_or_dfg());
        let non_flushing = MetadataItem::new(
            0,
            MetadataKind::Eos { flags: EosFlags::default(), tracking: None },
        );
        assert!(!non_flushing.is_flushing_eos_or_dfg());
        assert!(non_flushing.is_eos());
    }
}
