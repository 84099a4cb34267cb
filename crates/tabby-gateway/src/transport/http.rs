//! Minimal HTTP handling in front of the WebSocket upgrade.
//!
//! The gateway only needs to tell upgrade requests apart from everything
//! else, so it reads the request head and inspects it directly instead of
//! running a full HTTP stack. Non-upgrade requests get a static landing page.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

const HTTP_HEADER_END: &[u8] = b"\r\n\r\n";

/// Initial read buffer for the request head.
const INITIAL_BUFFER_SIZE: usize = 2048;

pub const LANDING_PAGE: &str = "<html>
<head><title>Tabby Connection Gateway</title></head>
<body>
<h1>Tabby Connection Gateway is running!</h1>
<p>This is the connection gateway service that Tabby Web uses. It's a WebSocket &rarr; TCP gateway that allows Tabby to initiate arbitrary network connections from a browser.</p>
</body>
</html>
";

/// Outcome of reading the request head off a fresh connection.
#[derive(Debug, PartialEq, Eq)]
pub enum HeadRead {
    /// Everything read so far; contains at least one complete head.
    Complete(Vec<u8>),
    /// Peer closed before sending a complete head.
    Closed,
    /// No head terminator within the size limit.
    TooLarge,
}

/// What to do with an inspected request.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// `Upgrade: websocket` was offered.
    Upgrade,
    /// Anything else; `head_only` for `HEAD` requests.
    Page { head_only: bool },
    /// Not HTTP/1.x.
    Invalid,
}

/// Read from `stream` until the end of the HTTP request head.
pub async fn read_request_head<S>(stream: &mut S, max_bytes: usize) -> std::io::Result<HeadRead>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(INITIAL_BUFFER_SIZE.min(max_bytes));
    let mut chunk = [0u8; INITIAL_BUFFER_SIZE];
    loop {
        if find_header_end(&buf).is_some() {
            return Ok(HeadRead::Complete(buf));
        }
        if buf.len() >= max_bytes {
            return Ok(HeadRead::TooLarge);
        }
        let want = chunk.len().min(max_bytes - buf.len());
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Ok(HeadRead::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Classify a request by its head.
pub fn inspect_request(buf: &[u8]) -> RequestKind {
    let header_end = match find_header_end(buf) {
        Some(end) => end,
        None => return RequestKind::Invalid,
    };
    let header_str = match std::str::from_utf8(&buf[..header_end]) {
        Ok(v) => v,
        Err(_) => return RequestKind::Invalid,
    };
    let mut lines = header_str.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let _path = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    if method.is_empty() || !version.starts_with("HTTP/1.") {
        return RequestKind::Invalid;
    }

    let upgrade = lines
        .filter_map(|line| line.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        });

    if upgrade {
        RequestKind::Upgrade
    } else {
        RequestKind::Page {
            head_only: method.eq_ignore_ascii_case("HEAD"),
        }
    }
}

/// Write the landing page response.
pub async fn send_landing_page<S>(stream: &mut S, head_only: bool) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/html; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        LANDING_PAGE.len()
    )
    .into_bytes();
    if !head_only {
        response.extend_from_slice(LANDING_PAGE.as_bytes());
    }
    stream.write_all(&response).await?;
    stream.shutdown().await
}

/// Reject a request that is not HTTP or whose head is too large.
pub async fn send_reject<S>(stream: &mut S, reason: &'static str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    warn!(reason, "request rejected");
    let response = b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    stream.write_all(response).await?;
    stream.shutdown().await
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HTTP_HEADER_END.len())
        .position(|w| w == HTTP_HEADER_END)
        .map(|idx| idx + HTTP_HEADER_END.len())
}
