//! Listener: accepts TCP connections, serves the landing page, and hands
//! upgraded WebSockets to a fresh [`Session`] each.
//!
//! The server holds nothing but the frozen configuration; every connection
//! runs in its own task and shares no mutable state with the others.

use crate::config::GatewayConfig;
use crate::session::Session;
use crate::transport::http::{self, HeadRead, RequestKind};
use crate::transport::{websocket, PrefixedStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tabby_gateway_core::{GatewayError, GatewayResult};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Time allowed for a client to send its request head.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The gateway server instance.
pub struct GatewayServer {
    config: Arc<GatewayConfig>,
}

impl GatewayServer {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self { config }
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> GatewayResult<TcpListener> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Transport(format!("bind {addr} failed: {e}")))?;
        info!(addr = %listener.local_addr()?, "gateway listening");
        Ok(listener)
    }

    /// Bind and serve until the task is cancelled.
    pub async fn run(self) -> GatewayResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept loop. Per-connection failures never stop it.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, remote, config).await {
                            debug!(remote = %remote, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    }
}

/// Serve one accepted TCP connection: landing page or WebSocket session.
async fn handle_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    config: Arc<GatewayConfig>,
) -> GatewayResult<()> {
    let head = match tokio::time::timeout(
        HEAD_READ_TIMEOUT,
        http::read_request_head(&mut stream, config.max_header_bytes),
    )
    .await
    {
        Ok(head) => head?,
        Err(_) => {
            debug!(remote = %remote, "timed out waiting for request head");
            return Ok(());
        }
    };

    let head = match head {
        HeadRead::Complete(buf) => buf,
        HeadRead::Closed => return Ok(()),
        HeadRead::TooLarge => {
            http::send_reject(&mut stream, "request head too large").await?;
            return Ok(());
        }
    };

    match http::inspect_request(&head) {
        RequestKind::Page { head_only } => {
            debug!(remote = %remote, "serving landing page");
            http::send_landing_page(&mut stream, head_only).await?;
        }
        RequestKind::Invalid => {
            http::send_reject(&mut stream, "not an HTTP/1.x request").await?;
        }
        RequestKind::Upgrade => {
            let ws = match websocket::accept_upgrade(PrefixedStream::new(head, stream), remote).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(remote = %remote, error = %e, "WebSocket handshake failed");
                    return Ok(());
                }
            };
            debug!(remote = %remote, "new connection established");
            Session::new(remote, config).run(ws).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server(auth_token: &str) -> SocketAddr {
        let config = GatewayConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            auth_token: auth_token.to_string(),
            ..GatewayConfig::default()
        };
        let server = GatewayServer::new(Arc::new(config));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    async fn raw_request(addr: SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    async fn recv_json(ws: &mut Client) -> Value {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn send_json(ws: &mut Client, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn non_upgrade_get_serves_landing_page() {
        let addr = start_server("").await;
        let response = raw_request(addr, b"GET / HTTP/1.1\r\nHost: gw\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("content-type: text/html; charset=utf-8\r\n"));
        assert!(response.contains("Tabby Connection Gateway"));
    }

    #[tokio::test]
    async fn any_method_without_upgrade_gets_the_page() {
        let addr = start_server("").await;
        let response = raw_request(
            addr,
            b"POST /anything HTTP/1.1\r\nHost: gw\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let addr = start_server("").await;
        let response = raw_request(addr, b"\x16\x03\x01hello\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn upgrade_echoes_subprotocol() {
        let addr = start_server("").await;
        let mut request = format!("ws://{addr}/").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("sec-websocket-protocol", HeaderValue::from_static("tabby"));
        let (mut ws, response) = connect_async(request).await.unwrap();
        assert_eq!(
            response.headers().get("sec-websocket-protocol").unwrap(),
            "tabby"
        );
        assert_eq!(
            recv_json(&mut ws).await,
            json!({"_": "hello", "version": 1, "auth_required": false})
        );
    }

    #[tokio::test]
    async fn end_to_end_relay() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        let addr = start_server("").await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        assert_eq!(
            recv_json(&mut ws).await,
            json!({"_": "hello", "version": 1, "auth_required": false})
        );
        send_json(&mut ws, json!({"_": "hello"})).await;
        assert_eq!(recv_json(&mut ws).await, json!({"_": "ready"}));
        send_json(
            &mut ws,
            json!({"_": "connect", "host": "127.0.0.1", "port": backend_port}),
        )
        .await;
        assert_eq!(recv_json(&mut ws).await, json!({"_": "connected"}));

        ws.send(Message::Binary(vec![0x41, 0x42])).await.unwrap();
        let (mut peer, _) = backend.accept().await.unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"AB");

        peer.write_all(b"XY").await.unwrap();
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => assert_eq!(&data[..], &[0x58, 0x59]),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_enabled_missing_token() {
        let addr = start_server("s3cret").await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        assert_eq!(
            recv_json(&mut ws).await,
            json!({"_": "hello", "version": 1, "auth_required": true})
        );
        send_json(&mut ws, json!({"_": "hello"})).await;
        assert_eq!(
            recv_json(&mut ws).await,
            json!({"_": "error", "code": "expected-auth-token"})
        );
        match ws.next().await {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_enabled_correct_token() {
        let addr = start_server("s3cret").await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        recv_json(&mut ws).await;
        send_json(&mut ws, json!({"_": "hello", "auth_token": "s3cret"})).await;
        assert_eq!(recv_json(&mut ws).await, json!({"_": "ready"}));
    }
}
