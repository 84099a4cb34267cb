//! Control messages exchanged during the handshake.
//!
//! Every control frame is a JSON object whose `_` field names the message.
//! Once the server has sent `connected`, no further control messages are
//! defined and every frame is opaque payload.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handshake protocol version advertised in the server HELLO.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "_", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello { version: u32, auth_required: bool },
    Ready,
    Connected,
    Error { code: ErrorCode },
}

impl ServerMessage {
    /// The first frame of every session.
    pub fn hello(auth_required: bool) -> Self {
        ServerMessage::Hello {
            version: PROTOCOL_VERSION,
            auth_required,
        }
    }

    pub fn error(code: ErrorCode) -> Self {
        ServerMessage::Error { code }
    }
}

/// Messages sent by the client while the handshake is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "_", rename_all = "lowercase")]
pub enum ClientMessage {
    Hello {
        #[serde(default)]
        auth_token: Option<String>,
    },
    /// `port` is kept wide so that out-of-range values surface as a
    /// target validation failure instead of a JSON error.
    Connect { host: String, port: i64 },
}

/// Error codes carried by `{"_":"error","code":...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    ExpectedHello,
    ExpectedAuthToken,
    IncorrectAuthToken,
    ExpectedConnect,
    ConnectFailed,
    ConnectTimedOut,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ExpectedHello => "expected-hello",
            ErrorCode::ExpectedAuthToken => "expected-auth-token",
            ErrorCode::IncorrectAuthToken => "incorrect-auth-token",
            ErrorCode::ExpectedConnect => "expected-connect",
            ErrorCode::ConnectFailed => "connect-failed",
            ErrorCode::ConnectTimedOut => "connect-timed-out",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated backend endpoint named by a CONNECT message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    /// Validate a host/port pair. Returns `None` for an empty host or a port
    /// outside `1..=65535`.
    pub fn new(host: impl Into<String>, port: i64) -> Option<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return None;
        }
        let port = u16::try_from(port).ok().filter(|p| *p != 0)?;
        Some(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
