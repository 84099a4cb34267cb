//! JSON codec for handshake control frames.
//!
//! Control frames travel as WebSocket text frames. Binary frames received
//! during the handshake are decoded as UTF-8 the same way.

use crate::error::{GatewayError, GatewayResult};
use crate::messages::{ClientMessage, ServerMessage};

/// Encode a server control message as the text of a WebSocket frame.
pub fn encode_control(msg: &ServerMessage) -> GatewayResult<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode a client control message from a frame payload.
pub fn decode_control(payload: &[u8]) -> GatewayResult<ClientMessage> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| GatewayError::Codec(format!("control frame is not UTF-8: {e}")))?;
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ErrorCode;

    #[test]
    fn encodes_compact_json() {
        let text = encode_control(&ServerMessage::error(ErrorCode::ExpectedHello)).unwrap();
        assert_eq!(text, r#"{"_":"error","code":"expected-hello"}"#);
    }

    #[test]
    fn decodes_connect() {
        let msg = decode_control(br#"{"_":"connect","host":"localhost","port":22}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Connect {
                host: "localhost".into(),
                port: 22
            }
        );
    }

    #[test]
    fn rejects_invalid_utf8() {
        let err = decode_control(&[0xff, 0xfe, b'{']).unwrap_err();
        assert!(matches!(err, GatewayError::Codec(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            decode_control(b"{\"_\":\"hello\""),
            Err(GatewayError::Codec(_))
        ));
        assert!(decode_control(b"").is_err());
    }
}
