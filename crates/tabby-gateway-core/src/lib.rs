//! tabby-gateway-core: control protocol for the Tabby connection gateway.
//!
//! Provides the JSON handshake message types exchanged over the WebSocket
//! before relaying starts, the codec for control frames, the error-code
//! vocabulary reported to clients, and validated connection targets.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_control, encode_control};
pub use error::{GatewayError, GatewayResult};
pub use messages::{ClientMessage, ErrorCode, ServerMessage, Target, PROTOCOL_VERSION};
