//! Minimal HTTP/1.1 reading and writing over a TCP stream.
//!
//! The proxy only ever speaks HTTP to the browser's debug endpoint and to
//! CDP clients performing `/json/*` requests, both of which use short
//! `Content-Length`-delimited messages. A full HTTP stack would be dead
//! weight here; this module reads and writes exactly what those exchanges
//! need.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on a request/response head before we give up.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on a message body.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Parsed request line and headers of an incoming HTTP request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

/// A complete HTTP response read from the browser.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Case-insensitive header lookup.
#[must_use]
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Byte offset of the `\r\n\r\n` head terminator, if present.
#[must_use]
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn parse_headers(lines: std::str::Lines<'_>) -> io::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid(format!("malformed header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

fn content_length(headers: &[(String, String)]) -> io::Result<Option<usize>> {
    match header(headers, "content-length") {
        None => Ok(None),
        Some(v) => v
            .parse::<usize>()
            .map(Some)
            .map_err(|_| invalid(format!("bad content-length: {v}"))),
    }
}

/// Parse a request head from raw bytes (not including the body).
pub fn parse_request_head(head: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(head).map_err(|_| invalid("request head is not UTF-8"))?;
    let mut lines = text.lines();
    let request_line = lines.next().ok_or_else(|| invalid("empty request"))?;
    let mut parts = request_line.split_ascii_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| invalid("missing method"))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| invalid("missing request target"))?
        .to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();
    Ok(RequestHead {
        method,
        target,
        version,
        headers: parse_headers(lines)?,
    })
}

impl RequestHead {
    /// Whether this request asks for a WebSocket upgrade.
    #[must_use]
    pub fn is_websocket_upgrade(&self) -> bool {
        header(&self.headers, "upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    #[must_use]
    pub fn content_length(&self) -> usize {
        content_length(&self.headers).ok().flatten().unwrap_or(0)
    }
}

/// Read a complete request (head + `Content-Length` body) from a stream.
pub async fn read_request(stream: &mut TcpStream) -> io::Result<(RequestHead, Vec<u8>)> {
    let (head_bytes, mut rest) = read_until_head_end(stream).await?;
    let head = parse_request_head(&head_bytes)?;

    let want = head.content_length();
    if want > MAX_BODY_BYTES {
        return Err(invalid(format!("request body too large: {want}")));
    }
    while rest.len() < want {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "request body truncated",
            ));
        }
        rest.extend_from_slice(&chunk[..n]);
    }
    rest.truncate(want);
    Ok((head, rest))
}

/// Read a complete response from a stream.
///
/// Bodies are delimited by `Content-Length` when present, otherwise by
/// connection close (the browser's endpoint sends one or the other).
pub async fn read_response(stream: &mut TcpStream) -> io::Result<HttpResponse> {
    let (head_bytes, mut body) = read_until_head_end(stream).await?;
    let text = std::str::from_utf8(&head_bytes).map_err(|_| invalid("response head not UTF-8"))?;
    let mut lines = text.lines();
    let status_line = lines.next().ok_or_else(|| invalid("empty response"))?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid(format!("bad status line: {status_line}")))?;
    let reason = parts.next().unwrap_or("").to_string();
    let headers = parse_headers(lines)?;

    match content_length(&headers)? {
        Some(want) => {
            if want > MAX_BODY_BYTES {
                return Err(invalid(format!("response body too large: {want}")));
            }
            while body.len() < want {
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "response body truncated",
                    ));
                }
                body.extend_from_slice(&chunk[..n]);
            }
            body.truncate(want);
        }
        None => {
            // No Content-Length: read to EOF.
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..n]);
                if body.len() > MAX_BODY_BYTES {
                    return Err(invalid("response body too large"));
                }
            }
        }
    }

    Ok(HttpResponse {
        status,
        reason,
        headers,
        body,
    })
}

/// Read from the stream until the head terminator appears. Returns the
/// head bytes (excluding the terminator) and whatever body bytes were
/// already buffered past it.
async fn read_until_head_end(stream: &mut TcpStream) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end + 4);
            buf.truncate(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(invalid("HTTP head too large"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before HTTP head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Serialize and send a request to the browser.
pub async fn write_request(
    stream: &mut TcpStream,
    head: &RequestHead,
    body: &[u8],
) -> io::Result<()> {
    let mut out = format!("{} {} {}\r\n", head.method, head.target, head.version).into_bytes();
    for (name, value) in &head.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    stream.write_all(&out).await?;
    stream.flush().await
}

/// Serialize and send a response to the client. `Content-Length` is set
/// from the body; any stale length header from the origin is replaced.
pub async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> io::Result<()> {
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n").into_bytes();
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    stream.write_all(&out).await?;
    stream.flush().await
}
