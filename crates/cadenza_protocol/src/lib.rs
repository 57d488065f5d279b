//! Message layer for the Cadenza container engine.
//!
//! Everything that crosses a container boundary is defined here: control-path
//! commands and their ack codes, data-path messages (buffer v1/v2, media
//! format, frame-length updates), metadata items that ride along with sample
//! bytes, and the channel bit-mask layout the container waits on.
//!
//! # Channel bit layout
//!
//! The container waits on a 32-bit signal word. The top three bits are
//! reserved; every external data port claims one of the remaining bits for
//! the lifetime of the port.
//!
//! ```text
//! [31] sync command   (0x8000_0000)
//! [30] periodic timer (0x4000_0000)
//! [29] command queue  (0x2000_0000)
//! [28..0] external data ports
//! ```

pub mod error;
pub mod media;
pub mod metadata;
pub mod msg;
pub mod types;

pub use error::{ProtocolError, Result};
pub use media::{DataFormat, Interleaving, MediaFormat, SUPPORTED_SAMPLE_RATES};
pub use metadata::{EosFlags, MetadataItem, MetadataKind};
pub use msg::{ChannelDesc, DataBuf, DataMsg, FrameLenUpdate, InPortMsg, OutPortMsg};
pub use types::{AckCode, ModuleIid, PortId, SubgraphId};

/// Reserved channel bit: synchronous command.
pub const SYNC_CMD_BIT_MASK: u32 = 0x8000_0000;
/// Reserved channel bit: periodic/STM timer signal.
pub const TIMER_BIT_MASK: u32 = 0x4000_0000;
/// Reserved channel bit: command queue.
pub const CMD_BIT_MASK: u32 = 0x2000_0000;

/// Bits available for external data ports.
pub const AVAILABLE_PORT_MASK: u32 = !(SYNC_CMD_BIT_MASK | TIMER_BIT_MASK | CMD_BIT_MASK);

/// Maximum number of commands expected ever in the command queue.
pub const MAX_CMD_Q_ELEMENTS: usize = 128;

/// Upper nibble of a data message token discriminates buffer layout.
pub const DATA_MSG_TOKEN_MASK: u32 = 0xF000_0000;
/// Token bit set when the message uses the per-channel (v2) layout.
pub const DATA_MSG_V2_TOKEN_BIT: u32 = 0x1000_0000;
pub const DATA_MSG_TOKEN_SHIFT: u32 = 28;

/// Build a data message token for the given layout.
pub fn data_msg_token(is_v2: bool) -> u32 {
    if is_v2 {
        DATA_MSG_V2_TOKEN_BIT
    } else {
        0
    }
}

/// Whether a data message token identifies the per-channel (v2) layout.
pub fn token_is_v2(token: u32) -> bool {
    (token & DATA_MSG_TOKEN_MASK) & DATA_MSG_V2_TOKEN_BIT != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_bits_do_not_overlap_port_mask() {
        assert_eq!(SYNC_CMD_BIT_MASK & AVAILABLE_PORT_MASK, 0);
        assert_eq!(TIMER_BIT_MASK & AVAILABLE_PORT_MASK, 0);
        assert_eq!(CMD_BIT_MASK & AVAILABLE_PORT_MASK, 0);
        assert_eq!(
            SYNC_CMD_BIT_MASK | TIMER_BIT_MASK | CMD_BIT_MASK | AVAILABLE_PORT_MASK,
            u32::MAX
        );
    }

    #[test]
    fn token_roundtrip() {
        assert!(token_is_v2(data_msg_token(true)));
        assert!(!token_is_v2(data_msg_token(false)));
        // lower bits of the token are payload-defined and must not disturb
        // the layout discriminator
        assert!(!token_is_v2(0x0FFF_FFFF));
        assert!(token_is_v2(DATA_MSG_V2_TOKEN_BIT | 0x0000_1234));
    }
}
