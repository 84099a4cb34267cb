use crate::messages::ErrorCode;
use thiserror::Error;

/// Errors produced by the gateway protocol and relay layers.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol violation: {}", .0.as_str())]
    Protocol(ErrorCode),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connect to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    #[error("timeout")]
    Timeout,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// The code reported to the client for this error, if it is client-visible.
    ///
    /// Transport and I/O failures return `None`: the WebSocket is assumed
    /// unusable and no control reply is attempted.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            GatewayError::Protocol(code) => Some(*code),
            GatewayError::Connect { .. } => Some(ErrorCode::ConnectFailed),
            GatewayError::Timeout => Some(ErrorCode::ConnectTimedOut),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Codec(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
