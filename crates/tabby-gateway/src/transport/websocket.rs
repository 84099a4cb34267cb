//! WebSocket upgrade and the per-session writer task, using tokio-tungstenite.
//!
//! A session splits its WebSocket: the session loop keeps the stream half
//! and a writer task owns the sink half. Control replies and relayed bytes
//! both go through the writer's bounded channel, so frames reach the client
//! in the order they were queued and a slow client back-pressures senders.

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::time::Duration;
use tabby_gateway_core::{encode_control, GatewayError, GatewayResult, ServerMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Outbound frames queued per session before senders wait.
const OUTBOUND_QUEUE: usize = 64;

/// How long teardown waits for the close frame to be flushed.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Perform the server side of the RFC 6455 handshake.
///
/// The first protocol offered in `Sec-WebSocket-Protocol` is echoed back.
pub async fn accept_upgrade<S>(stream: S, remote: SocketAddr) -> GatewayResult<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        debug!(remote = %remote, path = %req.uri().path(), "websocket upgrade");
        if let Some(protocol) = offered_protocol(req) {
            resp.headers_mut().insert("sec-websocket-protocol", protocol);
        }
        Ok(resp)
    };
    tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| GatewayError::Transport(format!("websocket handshake failed: {e}")))
}

fn offered_protocol(req: &Request) -> Option<HeaderValue> {
    let offered = req.headers().get("sec-websocket-protocol")?.to_str().ok()?;
    let first = offered.split(',').map(str::trim).find(|p| !p.is_empty())?;
    HeaderValue::from_str(first).ok()
}

/// Ask the writer to close the WebSocket, without waiting for queue space.
///
/// A no-op when the writer has already stopped, i.e. the WebSocket is no
/// longer open. When the queue is full the request is dropped and the
/// session teardown closes the socket instead.
pub fn request_close(outbound: &mpsc::Sender<Message>) {
    let _ = outbound.try_send(Message::Close(None));
}

/// Handle to the task that owns the sink half of a session's WebSocket.
pub struct WsWriter {
    tx: mpsc::Sender<Message>,
    task: JoinHandle<()>,
}

impl WsWriter {
    pub fn spawn<S>(sink: SplitSink<WebSocketStream<S>, Message>, remote: SocketAddr) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let task = tokio::spawn(write_loop(sink, rx, remote));
        Self { tx, task }
    }

    /// Channel feeding the writer, for the relay pump.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.tx.clone()
    }

    /// Queue a control message as a text frame.
    pub async fn send_control(&self, msg: &ServerMessage) -> GatewayResult<()> {
        let text = encode_control(msg)?;
        self.send(Message::Text(text)).await
    }

    pub async fn send(&self, msg: Message) -> GatewayResult<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| GatewayError::Transport("websocket is no longer open".into()))
    }

    /// Queue a frame only if there is room right now.
    ///
    /// A full queue means the client is not reading; the frame is dropped
    /// and this still returns `Ok`. Fails once the writer has stopped.
    pub fn send_if_room(&self, msg: Message) -> GatewayResult<()> {
        match self.tx.try_send(msg) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => {
                Err(GatewayError::Transport("websocket is no longer open".into()))
            }
        }
    }

    /// Close the WebSocket if it is still open and wait for the writer to finish.
    ///
    /// A client that has stopped reading leaves the queue full; the writer
    /// is then aborted, dropping the socket without a close frame.
    pub async fn close(self) {
        let Self { tx, mut task } = self;
        match tx.try_send(Message::Close(None)) {
            Ok(()) | Err(TrySendError::Closed(_)) => {
                drop(tx);
                if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut task).await.is_err() {
                    debug!("websocket close did not flush in time, aborting writer");
                    task.abort();
                }
            }
            Err(TrySendError::Full(_)) => {
                debug!("websocket outbound queue full, aborting writer");
                task.abort();
            }
        }
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Message>,
    remote: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            if !closing {
                warn!(remote = %remote, error = %e, "websocket send failed");
            }
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
    debug!(remote = %remote, "websocket writer stopped");
}
