//! HTTP/1.x request heads: just enough parsing to route and rewrite.
//!
//! Bodies are never interpreted; only the head of a request is parsed and,
//! when forwarded, re-serialized with the rewritten target and `Host`.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tracing::trace;
use url::Url;

use super::router::{RouteRequest, Target, HOP_COUNT_HEADER};
use super::stream::Rewind;

/// Heads larger than this are not treated as HTTP.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 96;

/// Reply to a client's `CONNECT`.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

/// Whether `data` is (or may still become) the start of an HTTP request line.
pub fn looks_like_http(data: &[u8]) -> bool {
    METHODS.iter().any(|method| {
        let method = method.as_bytes();
        if data.len() <= method.len() {
            method.starts_with(data)
        } else {
            data.starts_with(method) && data[method.len()] == b' '
        }
    })
}

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target exactly as sent.
    pub target: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Vec<(String, String)>,
    /// Length of the head in bytes, including the final CRLF.
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadParse {
    Complete(RequestHead),
    /// Plausibly HTTP but the head is not complete yet.
    Partial,
    NotHttp,
}

impl RequestHead {
    pub fn parse(data: &[u8]) -> HeadParse {
        if data.is_empty() || !looks_like_http(&data[..data.len().min(8)]) {
            return HeadParse::NotHttp;
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(data) {
            Ok(httparse::Status::Complete(len)) => {
                let (Some(method), Some(target), Some(version)) = (req.method, req.path, req.version)
                else {
                    return HeadParse::NotHttp;
                };
                HeadParse::Complete(Self {
                    method: method.to_string(),
                    target: target.to_string(),
                    version,
                    headers: req
                        .headers
                        .iter()
                        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                        .collect(),
                    len,
                })
            }
            Ok(httparse::Status::Partial) if data.len() < MAX_HEAD_BYTES => HeadParse::Partial,
            Ok(httparse::Status::Partial) => HeadParse::NotHttp,
            Err(e) => {
                trace!(error = %e, "Not an HTTP request head");
                HeadParse::NotHttp
            }
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// `host:port` of a `CONNECT` request.
    pub fn connect_authority(&self) -> Option<(String, u16)> {
        if !self.is_connect() {
            return None;
        }
        split_authority(&self.target, 443)
    }

    /// Hop count carried by a request the proxy sent to itself.
    pub fn hop_count(&self) -> u32 {
        self.header(HOP_COUNT_HEADER)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Routing view of this request.
    ///
    /// `tunnel` is the authority of an enclosing `CONNECT` tunnel, which both
    /// marks the request as forward-proxied and supplies a default host.
    pub fn to_route_request(
        &self,
        tls: bool,
        sni: Option<&str>,
        tunnel: Option<&(String, u16)>,
    ) -> RouteRequest {
        let default_scheme = if tls { "https" } else { "http" };

        if !self.target.starts_with('/') {
            if let Ok(url) = Url::parse(&self.target) {
                if url.has_host() {
                    let mut request = RouteRequest::new(url.scheme(), url.host_str().map(strip_brackets), url.path());
                    request.port = url.port_or_known_default();
                    request.query = url.query().map(str::to_string);
                    request.method = Some(self.method.clone());
                    request.headers = self.headers.clone();
                    request.forward = true;
                    return request;
                }
            }
        }

        let (path, query) = match self.target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (self.target.as_str(), None),
        };
        let default_port = if tls { 443 } else { 80 };
        let authority = self
            .header("host")
            .and_then(|h| split_authority(h, default_port))
            .or_else(|| tunnel.cloned())
            .or_else(|| sni.map(|s| (s.to_string(), default_port)));

        let path = if path.starts_with('/') { path } else { "/" };
        let mut request = RouteRequest::new(default_scheme, authority.as_ref().map(|(h, _)| h.as_str()), path);
        request.port = authority.map(|(_, p)| p);
        request.query = query;
        request.method = Some(self.method.clone());
        request.headers = self.headers.clone();
        request.forward = tunnel.is_some();
        request
    }

    /// Serialize this head addressed to `target`: origin-form request line,
    /// `Host` set to the target, and the hop header only when `hops` is given.
    pub fn rewrite(&self, target: &Target, hops: Option<u32>) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len + 64);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, target.request_target(), self.version).as_bytes(),
        );

        let mut wrote_host = false;
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case(HOP_COUNT_HEADER) || name.eq_ignore_ascii_case("proxy-connection") {
                continue;
            }
            if name.eq_ignore_ascii_case("host") {
                if wrote_host {
                    continue;
                }
                wrote_host = true;
                out.extend_from_slice(format!("{name}: {}\r\n", target.host_header()).as_bytes());
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !wrote_host {
            out.extend_from_slice(format!("Host: {}\r\n", target.host_header()).as_bytes());
        }
        if let Some(hops) = hops {
            out.extend_from_slice(format!("{HOP_COUNT_HEADER}: {hops}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Split `host[:port]` (IPv6 in brackets) into host and port.
pub fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_ascii_lowercase(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Some((host.to_ascii_lowercase(), port.parse().ok()?))
        }
        Some(_) => None,
        None => Some((authority.to_ascii_lowercase(), default_port)),
    }
}

fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Read from `stream` until a complete head is buffered, the data is clearly
/// not HTTP, the peer closes, or `timeout` elapses.
///
/// While the request line itself is incomplete, each further read waits at
/// most `line_timeout`, so a short payload that merely starts like a method
/// name is handed back without waiting for the whole head timeout.
///
/// Returns the parse result and every byte read. Nothing is rewound; the
/// caller owns the bytes.
pub async fn read_request_head<S>(
    stream: &mut Rewind<S>,
    line_timeout: Duration,
    timeout: Duration,
) -> std::io::Result<(HeadParse, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        let wait_until = if buffer.is_empty() || buffer.contains(&b'\n') {
            deadline
        } else {
            deadline.min(Instant::now() + line_timeout)
        };
        let read = tokio::time::timeout_at(wait_until, stream.read_buf(&mut buffer)).await;
        let eof = match read {
            Ok(Ok(n)) => n == 0,
            Ok(Err(e)) => return Err(e),
            Err(_) => true,
        };

        let parsed = RequestHead::parse(&buffer);
        if eof || !matches!(parsed, HeadParse::Partial) {
            return Ok((parsed, buffer));
        }
    }
}
