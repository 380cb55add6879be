//! Forwarding to the upstream HTTP debugging proxy.
//!
//! Two modes, chosen by the destination port:
//!
//! - [`ForwardMode::Direct`] (port 80): the client speaks plain HTTP. The
//!   first request head is rewritten into proxy form (absolute URI,
//!   `Connection: close`) and sent straight to the upstream proxy.
//! - [`ForwardMode::Tunnel`] (anything else): the bridge issues
//!   `CONNECT host:port` to the upstream proxy, requires a 2xx answer, and
//!   then relays opaque bytes.

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::session::SessionCounters;
use crate::socks5::TargetAddr;
use crate::{BridgeError, Result};

/// Largest response head accepted from the upstream CONNECT reply.
pub const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Largest client request head the direct mode will buffer for rewriting.
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// How a session talks to the upstream proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    /// Plain HTTP proxy request.
    Direct,
    /// HTTP CONNECT tunnel.
    Tunnel,
}

impl ForwardMode {
    pub fn for_port(port: u16) -> Self {
        if port == 80 {
            ForwardMode::Direct
        } else {
            ForwardMode::Tunnel
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// Build the CONNECT request for a target.
pub(crate) fn connect_request(target: &TargetAddr) -> String {
    let authority = target.authority();
    format!(
        "CONNECT {authority} HTTP/1.1\r\n\
         Host: {authority}\r\n\
         Proxy-Connection: keep-alive\r\n\
         \r\n"
    )
}

/// Extract the status code from a response head.
pub(crate) fn parse_status_code(head: &[u8]) -> Option<u16> {
    let line_end = head.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&head[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn status_line(head: &[u8]) -> String {
    let end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    String::from_utf8_lossy(&head[..end]).into_owned()
}

/// Read a response head, returning it along with any bytes read past it.
async fn read_response_head<S>(stream: &mut S, limit: usize) -> std::io::Result<(Vec<u8>, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed before completing the response head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let leftover = Bytes::copy_from_slice(&buf[end..]);
            buf.truncate(end);
            return Ok((buf, leftover));
        }
        if buf.len() > limit {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("response head exceeds {limit} bytes"),
            ));
        }
    }
}

/// Open a CONNECT tunnel through the upstream proxy.
///
/// Returns bytes the proxy sent after its response head; they belong to the
/// tunnelled stream and must reach the client first.
pub(crate) async fn establish_tunnel<S>(upstream: &mut S, target: &TargetAddr) -> Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    upstream
        .write_all(connect_request(target).as_bytes())
        .await?;
    upstream.flush().await?;

    let (head, leftover) = read_response_head(upstream, MAX_RESPONSE_HEAD).await?;
    match parse_status_code(&head) {
        Some(code) if (200..300).contains(&code) => {
            tracing::debug!(target_addr = %target, status = code, "CONNECT tunnel established");
            Ok(leftover)
        }
        _ => Err(BridgeError::TunnelRejected {
            target: target.authority(),
            status: status_line(&head),
        }),
    }
}

/// Rewrite an origin-form HTTP request head into proxy form.
///
/// - `GET /path HTTP/1.1` becomes `GET http://host/path HTTP/1.1`, where
///   `host` comes from the request's `Host` header, or from the destination
///   when there is none
/// - `Connection` and `Proxy-Connection` headers are replaced by
///   `Connection: close`
/// - a `Host` header is added if missing
///
/// Returns `None` if `head` does not look like an HTTP request head.
pub fn rewrite_request_head(head: &[u8], target: &TargetAddr) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(head).ok()?;
    let body = text.strip_suffix("\r\n\r\n")?;
    let mut lines = body.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next()?;
    let uri = parts.next()?;
    let version = parts.next()?;
    if method.is_empty() || !version.starts_with("HTTP/") {
        return None;
    }

    let headers: Vec<&str> = lines.collect();
    let host_header = headers.iter().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        let value = value.trim();
        (name.trim().eq_ignore_ascii_case("host") && !value.is_empty()).then_some(value)
    });
    let fallback = if target.port() == 80 {
        target.host()
    } else {
        target.authority()
    };
    let host = host_header.map_or(fallback, str::to_string);
    let absolute = if uri.starts_with('/') {
        format!("http://{host}{uri}")
    } else {
        uri.to_string()
    };

    let mut out = format!("{method} {absolute} {version}\r\n");
    for line in headers {
        let name = line.split(':').next().unwrap_or("").trim();
        if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("proxy-connection") {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    if host_header.is_none() {
        out.push_str(&format!("Host: {host}\r\n"));
    }
    out.push_str("Connection: close\r\n\r\n");
    Some(out.into_bytes())
}

/// Forward the client's first HTTP request head in proxy form.
///
/// Reads up to [`MAX_REQUEST_HEAD`] bytes or until `wait` elapses. If no
/// complete head arrives, whatever was read is forwarded untouched.
pub(crate) async fn prime_direct<C, U>(
    client: &mut C,
    upstream: &mut U,
    target: &TargetAddr,
    wait: std::time::Duration,
    counters: &SessionCounters,
) -> Result<()>
where
    C: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(2048);
    let mut chunk = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + wait;

    let head_end = loop {
        if let Some(end) = find_head_end(&buf) {
            break Some(end);
        }
        if buf.len() >= MAX_REQUEST_HEAD {
            break None;
        }
        match tokio::time::timeout_at(deadline, client.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break None,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e.into()),
        }
    };

    let rewritten = head_end.and_then(|end| {
        rewrite_request_head(&buf[..end], target).map(|mut head| {
            head.extend_from_slice(&buf[end..]);
            head
        })
    });
    let payload = match rewritten {
        Some(payload) => payload,
        None => {
            tracing::debug!(target_addr = %target, read = buf.len(), "Forwarding port 80 traffic without rewrite");
            buf
        }
    };

    if !payload.is_empty() {
        upstream.write_all(&payload).await?;
        upstream.flush().await?;
        counters.add_sent(payload.len());
    }
    Ok(())
}
