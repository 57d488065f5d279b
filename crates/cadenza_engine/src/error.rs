//! Engine error type and its mapping onto ack codes.

use cadenza_protocol::{AckCode, ProtocolError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Bad parameter: {0}")]
    BadParam(String),

    #[error("Allocation failed: {0}")]
    NoMemory(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("No free bit in external port mask")]
    PortMaskExhausted,

    #[error("Invalid topology: {0}")]
    TopologyInvalid(String),

    #[error("Need more data")]
    NeedMore,

    #[error("Container destroyed")]
    Terminated,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    pub fn ack_code(&self) -> AckCode {
        match self {
            EngineError::BadParam(_) => AckCode::BadParam,
            EngineError::NoMemory(_) => AckCode::NoMemory,
            EngineError::Unsupported(_) => AckCode::Unsupported,
            EngineError::NeedMore => AckCode::NeedMore,
            EngineError::Terminated => AckCode::Terminated,
            EngineError::Protocol(_) => AckCode::BadParam,
            EngineError::PortMaskExhausted
            | EngineError::TopologyInvalid(_)
            | EngineError::Failed(_) => AckCode::Failed,
        }
    }

    pub fn bad_param(msg: impl Into<String>) -> Self {
        EngineError::BadParam(msg.into())
    }

    pub fn topology(msg: impl Into<String>) -> Self {
        EngineError::TopologyInvalid(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        EngineError::Failed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_mapping() {
        assert_eq!(EngineError::bad_param("x").ack_code(), AckCode::BadParam);
        assert_eq!(EngineError::Terminated.ack_code(), AckCode::Terminated);
        assert_eq!(EngineError::topology("t").ack_code(), AckCode::Failed);
        assert_eq!(EngineError::PortMaskExhausted.ack_code(), AckCode::Failed);
    }
}
