//! Canonical identifier and result types used across all crates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Module instance identifier, assigned by the client at graph-open time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct ModuleIid(u32);

impl ModuleIid {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ModuleIid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl From<u32> for ModuleIid {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Port identifier, unique within its module.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct PortId(u32);

impl PortId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl From<u32> for PortId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Subgraph identifier, assigned by the client.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct SubgraphId(u32);

impl SubgraphId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SubgraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl From<u32> for SubgraphId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Result code carried by every command ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AckCode {
    Ok = 0,
    Failed = 1,
    NoMemory = 2,
    Unsupported = 3,
    BadParam = 4,
    NeedMore = 5,
    /// Container destroyed; the caller can reap the handle.
    Terminated = 6,
}

impl AckCode {
    pub fn is_ok(self) -> bool {
        matches!(self, AckCode::Ok)
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AckCode::Ok => "ok",
            AckCode::Failed => "failed",
            AckCode::NoMemory => "no-memory",
            AckCode::Unsupported => "unsupported",
            AckCode::BadParam => "bad-param",
            AckCode::NeedMore => "need-more",
            AckCode::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iid_display_is_hex() {
        assert_eq!(ModuleIid::new(0x1234).to_string(), "0x00001234");
    }

    #[test]
    fn ack_ok() {
        assert!(AckCode::Ok.is_ok());
        assert!(!AckCode::Terminated.is_ok());
    }
}
