//! TCP→WebSocket relay pump.
//!
//! Once a session is relaying, the pump owns the read half of the backend
//! connection and turns every read into one binary WebSocket frame, pushed
//! through the session's outbound channel. The WebSocket→TCP direction is
//! written by the session itself, so both directions progress independently.
//!
//! Closure policy:
//! - backend EOF ends the pump but leaves the WebSocket open; the client
//!   notices the quiet connection and closes it itself.
//! - a backend read error or a WebSocket that is no longer open asks the
//!   writer to close the WebSocket and ends the pump.

use std::net::SocketAddr;
use tabby_gateway_core::Target;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::transport::websocket::request_close;

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Backend closed its sending side.
    Eof,
    /// Backend read failed.
    TcpError,
    /// The WebSocket writer is gone.
    WebSocketClosed,
}

impl PumpExit {
    /// Whether the session must be torn down after this exit.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PumpExit::Eof)
    }
}

/// Handle to a spawned relay pump task.
pub struct RelayPump {
    handle: JoinHandle<PumpExit>,
    running: bool,
}

impl RelayPump {
    /// Spawn the pump for a freshly dialed backend.
    ///
    /// # Arguments
    ///
    /// * `read_half` - Backend read half, owned by the pump from now on.
    /// * `outbound` - Session writer channel; bounded, so a slow client
    ///   stalls backend reads instead of buffering without limit.
    /// * `buffer_size` - Upper bound of a single relayed chunk.
    pub fn spawn(
        read_half: OwnedReadHalf,
        outbound: mpsc::Sender<Message>,
        buffer_size: usize,
        client: SocketAddr,
        target: Target,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let exit = pump(read_half, &outbound, buffer_size).await;
            match exit {
                PumpExit::Eof => {
                    debug!(remote = %client, target = %target, "backend closed connection");
                }
                PumpExit::TcpError | PumpExit::WebSocketClosed => {
                    request_close(&outbound);
                    debug!(remote = %client, target = %target, exit = ?exit, "relay pump stopped");
                }
            }
            exit
        });
        Self {
            handle,
            running: true,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Wait for the pump to stop. Must not be called again once it returned.
    pub async fn wait(&mut self) -> PumpExit {
        let exit = match (&mut self.handle).await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(error = %e, "relay pump task failed");
                PumpExit::TcpError
            }
        };
        self.running = false;
        exit
    }

    /// Stop the pump. Dropping the read half releases the backend socket
    /// once the session has dropped the write half as well.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn pump(
    mut read_half: OwnedReadHalf,
    outbound: &mpsc::Sender<Message>,
    buffer_size: usize,
) -> PumpExit {
    let mut buf = vec![0u8; buffer_size];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => return PumpExit::Eof,
            Ok(n) => {
                let chunk = buf[..n].to_vec();
                if outbound.send(Message::Binary(chunk)).await.is_err() {
                    return PumpExit::WebSocketClosed;
                }
            }
            Err(e) => {
                warn!(error = %e, "backend read error");
                return PumpExit::TcpError;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn backend_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn test_target() -> Target {
        Target::new("127.0.0.1", 9).unwrap()
    }

    fn test_client() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn forwards_chunks_as_binary_frames_then_stops_on_eof() {
        let (gateway_side, mut peer) = backend_pair().await;
        let (read_half, _write_half) = gateway_side.into_split();
        let (tx, mut rx) = mpsc::channel(8);

        let mut pump = RelayPump::spawn(read_half, tx, 4096, test_client(), test_target());

        peer.write_all(b"XY").await.unwrap();
        match rx.recv().await {
            Some(Message::Binary(data)) => assert_eq!(&data[..], b"XY"),
            other => panic!("expected binary frame, got {other:?}"),
        }

        peer.shutdown().await.unwrap();
        assert_eq!(pump.wait().await, PumpExit::Eof);
        assert!(!pump.is_running());

        // EOF must not ask the writer to close the WebSocket.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn chunks_are_bounded_by_buffer_size() {
        let (gateway_side, mut peer) = backend_pair().await;
        let (read_half, _write_half) = gateway_side.into_split();
        let (tx, mut rx) = mpsc::channel(64);

        let mut pump = RelayPump::spawn(read_half, tx, 1024, test_client(), test_target());

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        peer.write_all(&payload).await.unwrap();
        peer.shutdown().await.unwrap();
        assert_eq!(pump.wait().await, PumpExit::Eof);

        let mut received = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Binary(data) => {
                    assert!(data.len() <= 1024);
                    received.extend_from_slice(&data);
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn closed_writer_stops_pump() {
        let (gateway_side, mut peer) = backend_pair().await;
        let (read_half, _write_half) = gateway_side.into_split();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let mut pump = RelayPump::spawn(read_half, tx, 4096, test_client(), test_target());
        peer.write_all(b"data").await.unwrap();

        let exit = pump.wait().await;
        assert_eq!(exit, PumpExit::WebSocketClosed);
        assert!(exit.is_fatal());
    }
}
