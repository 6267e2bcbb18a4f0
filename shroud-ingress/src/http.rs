//! HTTP handler: CONNECT tunnels and absolute-URI forward proxying.
//!
//! The inbound request head is parsed by hand because forward-proxy mode
//! must re-serialize the request byte-exactly (minus the hop headers) into
//! the CONNECT frame's first payload.

use std::sync::Arc;
use std::time::Duration;

use shroud_proto::Endpoint;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::routing::{self, Route};
use crate::state::AppState;
use crate::tunnel::relay::{self, ProxyKind};
use crate::direct;

/// Request head size cap.
const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Forward-proxy bodies beyond this are rejected rather than truncated.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
/// Head + body must arrive within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(300);

const FORWARD_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE",
];

/// Hop-by-hop headers stripped before forwarding.
const DROPPED_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("malformed request line {0:?}")]
    BadRequestLine(String),
    #[error("request head too large")]
    HeadTooLarge,
    #[error("missing Host header")]
    MissingHost,
    #[error("invalid target {0:?}")]
    BadTarget(String),
    #[error("body of {0} bytes exceeds the forward-proxy cap")]
    BodyTooLarge(usize),
}

/// A parsed request head with the original header lines preserved.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub header_lines: Vec<String>,
}

impl RequestHead {
    pub fn parse(text: &str) -> Result<Self, HttpError> {
        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v)) => (m, u, v),
            _ => return Err(HttpError::BadRequestLine(request_line.to_string())),
        };
        Ok(Self {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
            header_lines: lines
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_lines.iter().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.parse().ok()
    }
}

/// Derive the target endpoint and the re-serialized request head for
/// forward-proxy mode: relative request line, hop headers dropped,
/// everything else byte-identical.
pub fn rebuild_forward_request(head: &RequestHead) -> Result<(Endpoint, Vec<u8>), HttpError> {
    let (target, relative) = if head.uri.starts_with("http://") || head.uri.starts_with("https://")
    {
        let url =
            url::Url::parse(&head.uri).map_err(|_| HttpError::BadTarget(head.uri.clone()))?;
        let host = url
            .host_str()
            .ok_or_else(|| HttpError::BadTarget(head.uri.clone()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| HttpError::BadTarget(head.uri.clone()))?;
        let mut relative = url.path().to_string();
        if let Some(q) = url.query() {
            relative.push('?');
            relative.push_str(q);
        }
        (Endpoint::new(host, port), relative)
    } else {
        let host_header = head.header("host").ok_or(HttpError::MissingHost)?;
        let target = match Endpoint::parse(host_header) {
            Ok(ep) => ep,
            Err(shroud_proto::ParseAddrError::MissingPort(_)) => {
                Endpoint::new(host_header.trim_matches(['[', ']']), 80)
            }
            Err(_) => return Err(HttpError::BadTarget(host_header.to_string())),
        };
        (target, head.uri.clone())
    };

    let mut out = format!("{} {} {}\r\n", head.method, relative, head.version);
    for line in &head.header_lines {
        let name = line.split(':').next().unwrap_or("").trim().to_ascii_lowercase();
        if DROPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    Ok((target, out.into_bytes()))
}

/// Parse the CONNECT authority (`host:port`, port defaulting to 443).
pub fn parse_connect_target(authority: &str) -> Result<Endpoint, HttpError> {
    match Endpoint::parse(authority) {
        Ok(ep) => Ok(ep),
        Err(shroud_proto::ParseAddrError::MissingPort(_)) if !authority.is_empty() => Ok(
            Endpoint::new(authority.trim_matches(['[', ']']), 443),
        ),
        Err(_) => Err(HttpError::BadTarget(authority.to_string())),
    }
}

/// Outcome of the request-reading phase, decided before any relaying.
enum Action {
    /// CONNECT tunnel; `early` is whatever arrived past the blank line.
    Connect { target: Endpoint, early: Vec<u8> },
    /// Forward proxy; `request` is the rebuilt head plus any body bytes.
    Forward {
        target: Endpoint,
        method: String,
        request: Vec<u8>,
    },
    /// A reply (405) has already been written; nothing left to do.
    Rejected,
}

pub async fn handle(stream: TcpStream, state: Arc<AppState>) -> anyhow::Result<()> {
    // Only reading the request is bounded here; the relay phase runs under
    // its own keepalive-renewed deadline, as the SOCKS5 path does.
    let (stream, action) = match timeout(HANDSHAKE_TIMEOUT, read_request(stream)).await {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => return Err(e),
        Err(_) => anyhow::bail!("HTTP handshake timeout"),
    };

    match action {
        Action::Connect { target, early } => handle_connect(stream, state, target, early).await,
        Action::Forward {
            target,
            method,
            request,
        } => handle_forward(stream, state, target, method, request).await,
        Action::Rejected => Ok(()),
    }
}

/// Read and parse the request head (and, for forward proxying, the body),
/// answering protocol-level failures inline.
async fn read_request(mut stream: TcpStream) -> anyhow::Result<(TcpStream, Action)> {
    let (head_text, mut leftover) = match read_head(&mut stream).await {
        Ok(v) => v,
        Err(e) => {
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
                .await;
            return Err(e);
        }
    };
    let head = match RequestHead::parse(&head_text) {
        Ok(h) => h,
        Err(e) => {
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
                .await;
            return Err(e.into());
        }
    };

    if head.method == "CONNECT" {
        let target = match parse_connect_target(&head.uri) {
            Ok(t) => t,
            Err(e) => {
                let _ = stream
                    .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
                    .await;
                return Err(e.into());
            }
        };
        return Ok((stream, Action::Connect { target, early: leftover }));
    }

    if !FORWARD_METHODS.contains(&head.method.as_str()) {
        stream
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
            .await?;
        return Ok((stream, Action::Rejected));
    }

    // Forward-proxy mode: rebuild the request, bundle the body.
    let (target, mut request_bytes) = match rebuild_forward_request(&head) {
        Ok(v) => v,
        Err(e) => {
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
                .await;
            return Err(e.into());
        }
    };

    match head.content_length() {
        Some(len) => {
            if len > MAX_BODY_BYTES {
                stream
                    .write_all(b"HTTP/1.1 413 Payload Too Large\r\n\r\n")
                    .await?;
                return Err(HttpError::BodyTooLarge(len).into());
            }
            while leftover.len() < len {
                let mut chunk = vec![0u8; (len - leftover.len()).min(64 * 1024)];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    anyhow::bail!("client closed mid-body");
                }
                leftover.extend_from_slice(&chunk[..n]);
            }
            request_bytes.extend_from_slice(&leftover[..len]);
        }
        // No Content-Length (e.g. chunked): bundle whatever body bytes
        // already arrived; the rest streams through the relay.
        None => request_bytes.extend_from_slice(&leftover),
    }

    Ok((
        stream,
        Action::Forward {
            target,
            method: head.method,
            request: request_bytes,
        },
    ))
}

async fn handle_forward(
    mut stream: TcpStream,
    state: Arc<AppState>,
    target: Endpoint,
    method: String,
    request: Vec<u8>,
) -> anyhow::Result<()> {
    let tables = state.ranges();
    let route = routing::decide(state.config.routing, &target.host, &tables).await;
    debug!(target = %target, ?route, method = %method, "HTTP forward proxy");

    match route {
        Route::Direct => match direct::dial(&target).await {
            Ok(upstream) => {
                direct::run(stream, upstream, &request).await;
                Ok(())
            }
            Err(e) => {
                warn!(target = %target, error = %e, "direct dial failed");
                let _ = stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                Ok(())
            }
        },
        Route::Tunnel => {
            relay::run_tunneled(state, stream, target, request, ProxyKind::HttpProxy).await;
            Ok(())
        }
    }
}

async fn handle_connect(
    mut stream: TcpStream,
    state: Arc<AppState>,
    target: Endpoint,
    early: Vec<u8>,
) -> anyhow::Result<()> {
    let tables = state.ranges();
    let route = routing::decide(state.config.routing, &target.host, &tables).await;
    debug!(target = %target, ?route, "HTTP CONNECT");

    match route {
        Route::Direct => match direct::dial(&target).await {
            Ok(upstream) => {
                stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await?;
                direct::run(stream, upstream, &early).await;
                Ok(())
            }
            Err(e) => {
                debug!(target = %target, error = %e, "direct dial failed");
                let _ = stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                Ok(())
            }
        },
        Route::Tunnel => {
            relay::run_tunneled(state, stream, target, early, ProxyKind::HttpConnect).await;
            Ok(())
        }
    }
}

/// Read up to the blank line; returns the head text and any bytes already
/// received past it.
async fn read_head(stream: &mut TcpStream) -> anyhow::Result<(String, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("client closed before request head");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let head = String::from_utf8(buf[..end].to_vec())?;
            let leftover = buf[end + 4..].to_vec();
            return Ok((head, leftover));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(HttpError::HeadTooLarge.into());
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_head() {
        let head = RequestHead::parse(
            "GET http://example.com/hi HTTP/1.1\r\nHost: example.com\r\nAccept: */*",
        )
        .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.uri, "http://example.com/hi");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("host"), Some("example.com"));
        assert_eq!(head.header("accept"), Some("*/*"));
        assert_eq!(head.header("missing"), None);
    }

    #[test]
    fn forward_rewrite_drops_hop_headers() {
        let head = RequestHead::parse(
            "GET http://example.com/hi HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive",
        )
        .unwrap();
        let (target, bytes) = rebuild_forward_request(&head).unwrap();
        assert_eq!(target, Endpoint::new("example.com", 80));
        assert_eq!(
            bytes,
            b"GET /hi HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn forward_rewrite_keeps_query_and_other_headers() {
        let head = RequestHead::parse(
            "POST http://example.com:8080/p?x=1 HTTP/1.1\r\nHost: example.com:8080\r\nProxy-Authorization: Basic xxx\r\nContent-Length: 2",
        )
        .unwrap();
        let (target, bytes) = rebuild_forward_request(&head).unwrap();
        assert_eq!(target, Endpoint::new("example.com", 8080));
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("POST /p?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("Proxy-Authorization"));
    }

    #[test]
    fn forward_relative_uri_uses_host_header() {
        let head =
            RequestHead::parse("GET /path HTTP/1.1\r\nHost: example.org").unwrap();
        let (target, bytes) = rebuild_forward_request(&head).unwrap();
        assert_eq!(target, Endpoint::new("example.org", 80));
        assert!(String::from_utf8(bytes)
            .unwrap()
            .starts_with("GET /path HTTP/1.1\r\n"));
    }

    #[test]
    fn forward_https_default_port() {
        let head = RequestHead::parse("GET https://example.com/ HTTP/1.1\r\nHost: example.com")
            .unwrap();
        let (target, _) = rebuild_forward_request(&head).unwrap();
        assert_eq!(target.port, 443);
    }

    #[test]
    fn missing_host_is_an_error() {
        let head = RequestHead::parse("GET /path HTTP/1.1\r\nAccept: */*").unwrap();
        assert!(matches!(
            rebuild_forward_request(&head),
            Err(HttpError::MissingHost)
        ));
    }

    #[test]
    fn connect_target_parsing() {
        assert_eq!(
            parse_connect_target("example.com:8443").unwrap(),
            Endpoint::new("example.com", 8443)
        );
        assert_eq!(
            parse_connect_target("example.com").unwrap(),
            Endpoint::new("example.com", 443)
        );
        assert_eq!(
            parse_connect_target("[2001:db8::1]:443").unwrap(),
            Endpoint::new("2001:db8::1", 443)
        );
        assert!(parse_connect_target("example.com:0").is_err());
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(14));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }
}
