//! Transport layer: the HTTP request head, the WebSocket upgrade, and the
//! per-session WebSocket writer.

pub mod http;
pub mod prefixed;
pub mod websocket;

pub use prefixed::PrefixedStream;
