//! Protocol error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("Invalid channel count: {got} (max {max})")]
    InvalidChannelCount { got: u16, max: u16 },

    #[error("Invalid bit width: {0}")]
    InvalidBitWidth(u16),

    #[error("Payload too short: expected {expected} bytes, got {got}")]
    PayloadTooShort { expected: usize, got: usize },

    #[error("Channel descriptor count mismatch: media format has {channels} channels, message has {descriptors} descriptors")]
    DescriptorMismatch { channels: usize, descriptors: usize },

    #[error("Descriptor length {desc_len} exceeds payload length {payload_len}")]
    DescriptorOverrun { desc_len: usize, payload_len: usize },

    #[error("Unequal per-channel lengths in unpacked buffer: {0:?}")]
    UnequalChannelLengths(Vec<usize>),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}
