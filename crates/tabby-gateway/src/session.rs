//! Per-connection session: the handshake state machine and the
//! WebSocket→TCP half of the relay.
//!
//! ```text
//! AwaitingHello ─hello─▶ [AwaitingAuth] ─▶ AwaitingConnect ─connect─▶ Connecting
//!                                                                        │ first frame
//!                                                                        ▼
//!                        Closed ◀──── close / error / violation ──── Relaying
//! ```
//!
//! The server sends `connected` as soon as the CONNECT message is accepted
//! and only dials the backend when the next frame arrives. That frame is
//! both the dial trigger and the first relayed payload.

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tabby_gateway_core::{
    decode_control, ClientMessage, ErrorCode, GatewayError, GatewayResult, ServerMessage, Target,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::relay::{PumpExit, RelayPump};
use crate::transport::websocket::WsWriter;

/// Handshake and relay phases, in the only order they can be visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHello,
    AwaitingAuth,
    AwaitingConnect,
    Connecting,
    Relaying,
    Closed,
}

/// An open backend connection: the session writes, the pump reads.
struct Backend {
    writer: OwnedWriteHalf,
    pump: RelayPump,
}

/// One accepted WebSocket, from upgrade to teardown.
pub struct Session {
    client_addr: SocketAddr,
    config: Arc<GatewayConfig>,
    state: SessionState,
    target: Option<Target>,
    tcp: Option<Backend>,
    auth_required: bool,
}

/// A WebSocket read, reduced to what the state machine cares about.
enum Inbound {
    /// Text (as UTF-8 bytes) or binary payload.
    Payload(Vec<u8>),
    /// Ping/pong traffic; only keeps the connection alive.
    Keepalive,
    Closed,
    Failed(tungstenite::Error),
}

impl Inbound {
    fn from_item(item: Option<Result<Message, tungstenite::Error>>) -> Self {
        match item {
            Some(Ok(Message::Text(text))) => Inbound::Payload(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => Inbound::Payload(data),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => Inbound::Keepalive,
            Some(Ok(Message::Close(_))) | None => Inbound::Closed,
            Some(Err(e)) => Inbound::Failed(e),
        }
    }
}

impl Session {
    pub fn new(client_addr: SocketAddr, config: Arc<GatewayConfig>) -> Self {
        let auth_required = config.auth_required();
        Self {
            client_addr,
            config,
            state: SessionState::AwaitingHello,
            target: None,
            tcp: None,
            auth_required,
        }
    }

    /// Drive a single WebSocket to completion.
    pub async fn run<S>(mut self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut stream) = ws.split();
        let writer = WsWriter::spawn(sink, self.client_addr);
        debug!(remote = %self.client_addr, "session opened");

        // HELLO goes out before any client frame is read.
        let hello = ServerMessage::hello(self.auth_required);
        if let Err(e) = writer.send_control(&hello).await {
            debug!(remote = %self.client_addr, error = %e, "could not send hello");
            self.teardown(writer).await;
            return;
        }

        // Half the idle timeout without inbound traffic triggers a ping; a
        // second silent half closes the session.
        let keepalive = self.config.idle_timeout / 2;
        let idle = tokio::time::sleep(keepalive);
        tokio::pin!(idle);
        let mut pinged = false;

        loop {
            tokio::select! {
                item = stream.next() => {
                    idle.as_mut().reset(Instant::now() + keepalive);
                    pinged = false;
                    match Inbound::from_item(item) {
                        Inbound::Payload(payload) => {
                            if let Err(e) = self.on_message(payload, &writer, &mut stream).await {
                                debug!(remote = %self.client_addr, error = %e, "session failed");
                                break;
                            }
                            if self.state == SessionState::Closed {
                                break;
                            }
                        }
                        Inbound::Keepalive => {}
                        Inbound::Closed => {
                            debug!(remote = %self.client_addr, "client closed websocket");
                            break;
                        }
                        Inbound::Failed(e) => {
                            debug!(remote = %self.client_addr, error = %e, "websocket read failed");
                            break;
                        }
                    }
                }

                exit = pump_exit(&mut self.tcp) => {
                    if exit.is_fatal() {
                        break;
                    }
                }

                () = &mut idle => {
                    if pinged {
                        info!(remote = %self.client_addr, "websocket idle timeout");
                        break;
                    }
                    pinged = true;
                    // A client that is not reading cannot take a ping either.
                    if writer.send_if_room(Message::Ping(Vec::new())).is_err() {
                        break;
                    }
                    idle.as_mut().reset(Instant::now() + keepalive);
                }
            }
        }

        self.teardown(writer).await;
    }

    async fn on_message<S>(
        &mut self,
        payload: Vec<u8>,
        writer: &WsWriter,
        stream: &mut SplitStream<WebSocketStream<S>>,
    ) -> GatewayResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.state {
            SessionState::AwaitingHello | SessionState::AwaitingConnect => {
                match self.on_control(&payload) {
                    Ok(reply) => writer.send_control(&reply).await,
                    Err(e) => {
                        if let Some(code) = e.code() {
                            warn!(remote = %self.client_addr, code = %code, "handshake rejected");
                            // Best effort: the session closes either way.
                            let _ = writer.send_control(&ServerMessage::error(code)).await;
                        }
                        Ok(())
                    }
                }
            }
            SessionState::Connecting => self.connect(payload, writer, stream).await,
            SessionState::Relaying => self.forward(VecDeque::from([payload]), stream).await,
            SessionState::AwaitingAuth | SessionState::Closed => {
                self.state = SessionState::Closed;
                Ok(())
            }
        }
    }

    /// Apply one handshake message and return the reply to send.
    ///
    /// On error the session is `Closed` and the error carries the code to
    /// report. Performs no I/O.
    pub fn on_control(&mut self, payload: &[u8]) -> GatewayResult<ServerMessage> {
        let result = match self.state {
            SessionState::AwaitingHello => self.on_hello(payload),
            SessionState::AwaitingConnect => self.on_connect(payload),
            state => Err(GatewayError::Other(format!(
                "no control message expected in state {state:?}"
            ))),
        };
        if result.is_err() {
            self.state = SessionState::Closed;
        }
        result
    }

    fn on_hello(&mut self, payload: &[u8]) -> GatewayResult<ServerMessage> {
        let auth_token = match decode_control(payload) {
            Ok(ClientMessage::Hello { auth_token }) => auth_token,
            _ => return Err(GatewayError::Protocol(ErrorCode::ExpectedHello)),
        };
        if self.auth_required {
            self.state = SessionState::AwaitingAuth;
            self.authenticate(auth_token.as_deref())?;
        }
        self.state = SessionState::AwaitingConnect;
        Ok(ServerMessage::Ready)
    }

    fn authenticate(&self, token: Option<&str>) -> GatewayResult<()> {
        match token {
            None | Some("") => Err(GatewayError::Protocol(ErrorCode::ExpectedAuthToken)),
            Some(token) if token.as_bytes() == self.config.auth_token.as_bytes() => Ok(()),
            Some(_) => Err(GatewayError::Protocol(ErrorCode::IncorrectAuthToken)),
        }
    }

    fn on_connect(&mut self, payload: &[u8]) -> GatewayResult<ServerMessage> {
        let (host, port) = match decode_control(payload) {
            Ok(ClientMessage::Connect { host, port }) => (host, port),
            _ => return Err(GatewayError::Protocol(ErrorCode::ExpectedConnect)),
        };
        let target = Target::new(host, port)
            .ok_or(GatewayError::Protocol(ErrorCode::ExpectedConnect))?;
        debug!(remote = %self.client_addr, target = %target, "connect requested");
        self.target = Some(target);
        self.state = SessionState::Connecting;
        Ok(ServerMessage::Connected)
    }

    /// Dial the target, triggered by the first frame after `connected`.
    ///
    /// Frames arriving while the dial is in flight are queued behind the
    /// trigger frame. If the client goes away first, the dial is dropped
    /// along with any socket it produced.
    async fn connect<S>(
        &mut self,
        first: Vec<u8>,
        writer: &WsWriter,
        stream: &mut SplitStream<WebSocketStream<S>>,
    ) -> GatewayResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let target = match self.target.clone() {
            Some(target) => target,
            None => {
                self.state = SessionState::Closed;
                return Ok(());
            }
        };

        let mut pending = vec![first];
        let dialed = {
            let dial = dial(&target, self.config.connect_timeout);
            tokio::pin!(dial);
            loop {
                tokio::select! {
                    result = &mut dial => break result,
                    item = stream.next() => match Inbound::from_item(item) {
                        Inbound::Payload(payload) => pending.push(payload),
                        Inbound::Keepalive => {}
                        Inbound::Closed | Inbound::Failed(_) => {
                            debug!(remote = %self.client_addr, target = %target, "client left during dial");
                            self.state = SessionState::Closed;
                            return Ok(());
                        }
                    },
                }
            }
        };

        let tcp = match dialed {
            Ok(tcp) => tcp,
            Err(e) => {
                warn!(remote = %self.client_addr, target = %target, error = %e, "backend connect failed");
                if let Some(code) = e.code() {
                    let _ = writer.send_control(&ServerMessage::error(code)).await;
                }
                self.state = SessionState::Closed;
                return Ok(());
            }
        };

        info!(remote = %self.client_addr, target = %target, "relay connection established");
        let (read_half, write_half) = tcp.into_split();
        let pump = RelayPump::spawn(
            read_half,
            writer.sender(),
            self.config.relay_buffer,
            self.client_addr,
            target,
        );
        self.tcp = Some(Backend {
            writer: write_half,
            pump,
        });
        self.state = SessionState::Relaying;
        self.forward(VecDeque::from(pending), stream).await
    }

    /// Write queued client payload to the backend, in order.
    ///
    /// While the backend is slow the WebSocket is still watched for a close
    /// and the pump for a failure. Payload read meanwhile joins the queue
    /// until it holds `relay_buffer` bytes; past that the WebSocket is left
    /// unread. A backend that accepts nothing for a whole idle timeout ends
    /// the session.
    async fn forward<S>(
        &mut self,
        mut queue: VecDeque<Vec<u8>>,
        stream: &mut SplitStream<WebSocketStream<S>>,
    ) -> GatewayResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Backend { writer, pump } = match self.tcp.as_mut() {
            Some(backend) => backend,
            None => return Err(GatewayError::Transport("no backend connection".into())),
        };
        let limit = self.config.relay_buffer;
        let stall_timeout = self.config.idle_timeout;
        let stall = tokio::time::sleep(stall_timeout);
        tokio::pin!(stall);
        let mut queued: usize = queue.iter().map(Vec::len).sum();
        let mut offset = 0;

        while let Some(front) = queue.front() {
            if offset == front.len() {
                queued -= front.len();
                queue.pop_front();
                offset = 0;
                continue;
            }
            // `write` is cancel safe, so losing the race never drops bytes.
            tokio::select! {
                written = writer.write(&front[offset..]) => {
                    match written? {
                        0 => return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into()),
                        n => offset += n,
                    }
                    stall.as_mut().reset(Instant::now() + stall_timeout);
                }

                item = stream.next(), if queued < limit => match Inbound::from_item(item) {
                    Inbound::Payload(payload) => {
                        queued += payload.len();
                        queue.push_back(payload);
                    }
                    Inbound::Keepalive => {}
                    Inbound::Closed | Inbound::Failed(_) => {
                        debug!(remote = %self.client_addr, "client left while backend was busy");
                        self.state = SessionState::Closed;
                        return Ok(());
                    }
                },

                exit = pump.wait(), if pump.is_running() => {
                    if exit.is_fatal() {
                        self.state = SessionState::Closed;
                        return Ok(());
                    }
                }

                () = &mut stall => {
                    info!(remote = %self.client_addr, "backend stopped accepting data");
                    self.state = SessionState::Closed;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Release both sides: the backend first, then the WebSocket.
    async fn teardown(&mut self, writer: WsWriter) {
        self.state = SessionState::Closed;
        if let Some(mut backend) = self.tcp.take() {
            backend.pump.abort();
            let _ = backend.writer.shutdown().await;
        }
        writer.close().await;
        match &self.target {
            Some(target) => {
                info!(remote = %self.client_addr, target = %target, "websocket connection closed")
            }
            None => debug!(remote = %self.client_addr, "websocket connection closed"),
        }
    }
}

async fn dial(target: &Target, timeout: Duration) -> GatewayResult<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((target.host(), target.port())))
        .await
        .map_err(|_| GatewayError::Timeout)?
        .map_err(|e| GatewayError::Connect {
            target: target.to_string(),
            reason: e.to_string(),
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(target = %target, error = %e, "could not set TCP_NODELAY");
    }
    Ok(stream)
}

/// Resolves when the relay pump stops; pending while there is none.
async fn pump_exit(tcp: &mut Option<Backend>) -> PumpExit {
    match tcp {
        Some(backend) if backend.pump.is_running() => backend.pump.wait().await,
        _ => std::future::pending().await,
    }
}
