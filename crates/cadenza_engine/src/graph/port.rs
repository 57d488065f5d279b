//! Data-port state shared by internal and external ports.

use crate::buffers::{ChannelBufs, StreamFlags};
use crate::metadata::MetadataList;
use cadenza_protocol::{MediaFormat, PortId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortState {
    #[default]
    Invalid,
    Prepared,
    Started,
    Suspended,
    Stopped,
}

impl PortState {
    pub fn is_started(self) -> bool {
        matches!(self, PortState::Started)
    }

    /// The effective state of a connection is the weaker of the two sides.
    pub fn downgrade(self, other: PortState) -> PortState {
        use PortState::*;
        match (self, other) {
            (Invalid, _) | (_, Invalid) => Invalid,
            (Stopped, _) | (_, Stopped) => Stopped,
            (Suspended, _) | (_, Suspended) => Suspended,
            (Prepared, _) | (_, Prepared) => Prepared,
            (Started, Started) => Started,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFlowState {
    #[default]
    AtGap,
    Flowing,
}

/// Non-trigger policy a trigger-policy module assigns to a port for a given
/// trigger kind: how the port behaves when it is NOT part of the satisfied
/// trigger group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonTriggerPolicy {
    /// Port participates normally.
    #[default]
    None,
    /// Port may be absent from the trigger without blocking.
    Optional,
    /// Port must not trigger processing.
    Blocked,
}

/// Threshold bookkeeping per port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortThreshold {
    /// Threshold the module declared on this port, in bytes (total across
    /// channels). `None` when the module declares none.
    pub raised_bytes: Option<u64>,
    /// Working flag reset from `raised_bytes` at the start of each
    /// propagation pass.
    pub has_threshold: bool,
    /// Effective per-call amount in bytes after propagation.
    pub thresh_bytes: u64,
    /// Pending new threshold to inform the module of.
    pub pending_new_bytes: Option<u64>,
    /// Propagation could not finish because media format is unknown; the
    /// port is revisited once MF arrives.
    pub not_complete: bool,
}

/// Fields common to input and output ports.
#[derive(Debug, Default)]
pub struct PortCommon {
    pub id: PortId,
    pub media_fmt: Option<MediaFormat>,
    pub state: PortState,
    pub data_flow_state: DataFlowState,
    pub bufs: ChannelBufs,
    pub flags: StreamFlags,
    pub timestamp_us: i64,
    pub threshold: PortThreshold,
    pub md_list: MetadataList,
    pub nontrigger_policy: NonTriggerPolicy,
    /// Visit marker used by the threshold propagator.
    pub marker: bool,
}

impl PortCommon {
    pub fn new(id: PortId) -> Self {
        Self { id, ..Default::default() }
    }

    pub fn has_valid_media_fmt(&self) -> bool {
        self.media_fmt.is_some()
    }

    /// Total max buffer length across channel buffers.
    pub fn max_buf_len(&self) -> usize {
        self.bufs.max_len_per_buf * self.bufs.num_bufs()
    }

    /// Reset data and metadata; used on stop and on flush.
    pub fn reset_data(&mut self) {
        self.bufs.clear();
        self.md_list.clear();
        self.flags = StreamFlags::default();
        self.data_flow_state = DataFlowState::AtGap;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrade_prefers_weaker() {
        use PortState::*;
        assert_eq!(Started.downgrade(Started), Started);
        assert_eq!(Started.downgrade(Stopped), Stopped);
        assert_eq!(Prepared.downgrade(Started), Prepared);
        assert_eq!(Suspended.downgrade(Prepared), Suspended);
        assert_eq!(Invalid.downgrade(Started), Invalid);
    }

    #[test]
    fn stopped_port_reset_invariant() {
        let mut p = PortCommon::new(PortId::new(2));
        p.bufs = ChannelBufs::new(2, 480);
        p.bufs.bufs[0].append(&[1; 10]);
        p.bufs.bufs[1].append(&[1; 10]);
        p.md_list.push(cadenza_protocol::MetadataItem::dfg(4));
        p.reset_data();
        assert_eq!(p.bufs.actual_len_total(), 0);
        assert!(p.md_list.is_empty());
        assert_eq!(p.data_flow_state, DataFlowState::AtGap);
    }
}
