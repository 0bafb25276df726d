//! Upstream connections.
//!
//! Candidates are tried in order and the first one that connects (and
//! completes its TLS handshake, when re-originating) wins. Each attempt is
//! bounded by the connect timeout; a timed out candidate counts as
//! unreachable. Failed probes are logged at debug level only.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ForwardProxy;
use crate::error::{RoutingError, TlsError};
use crate::proxy::router::{RouteResolver, Target};
use crate::proxy::stream::UpstreamStream;
use crate::proxy::tls::TlsInterceptor;

/// Largest CONNECT response head accepted from a forward proxy.
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Why a single candidate could not be used.
#[derive(Debug, Error)]
pub enum ConnectFailure {
    #[error("connect to {0} timed out")]
    Timeout(String),

    #[error("connect to {target} failed: {source}")]
    Io {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("forward proxy {proxy} refused CONNECT {target}: {status}")]
    ProxyRefused {
        proxy: String,
        target: String,
        status: String,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// What runs on top of the upstream TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport<'a> {
    Plain,
    /// Re-originated TLS, offering `alpn` when the client negotiated one.
    Tls { alpn: Option<&'a [u8]> },
}

/// An established upstream connection.
#[derive(Debug)]
pub struct Upstream {
    pub stream: UpstreamStream,
    pub target: Target,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    /// Reached through the configured forward proxy.
    pub via_proxy: bool,
    _self_connection: Option<SelfConnection>,
}

/// Keeps the hop count of a connection to ourselves registered until the
/// accepting side has claimed it or the connection is gone.
struct SelfConnection {
    resolver: Arc<RouteResolver>,
    local: SocketAddr,
}

impl std::fmt::Debug for SelfConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SelfConnection").field(&self.local).finish()
    }
}

impl Drop for SelfConnection {
    fn drop(&mut self) {
        self.resolver.forget_self_connection(&self.local);
    }
}

#[derive(Debug, Default)]
pub struct ConnectorStats {
    pub attempted: AtomicU64,
    pub succeeded: AtomicU64,
}

/// Opens outbound connections, directly or through a forward proxy.
pub struct UpstreamConnector {
    resolver: Arc<RouteResolver>,
    tls: Arc<TlsInterceptor>,
    forward_proxy: Option<ForwardProxy>,
    connect_timeout: Duration,
    stats: ConnectorStats,
}

impl UpstreamConnector {
    pub fn new(
        resolver: Arc<RouteResolver>,
        tls: Arc<TlsInterceptor>,
        forward_proxy: Option<ForwardProxy>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            tls,
            forward_proxy,
            connect_timeout,
            stats: ConnectorStats::default(),
        }
    }

    pub fn stats(&self) -> &ConnectorStats {
        &self.stats
    }

    pub fn forward_proxy(&self) -> Option<&ForwardProxy> {
        self.forward_proxy.as_ref()
    }

    /// Connect to the first reachable candidate.
    ///
    /// `reoriginate_tls` wraps TLS targets in a client handshake; it is off
    /// when client TLS is relayed without termination. `alpn` is the protocol
    /// negotiated with the client, offered again upstream. `hops` is recorded
    /// for connections that land back on this proxy.
    pub async fn connect_first(
        &self,
        host: &str,
        targets: &[Target],
        reoriginate_tls: bool,
        alpn: Option<&[u8]>,
        hops: u32,
    ) -> Result<Upstream, RoutingError> {
        let mut last_failure = None;
        for target in targets {
            let transport = if reoriginate_tls && target.tls {
                Transport::Tls { alpn }
            } else {
                Transport::Plain
            };
            match self.connect(target, transport, hops).await {
                Ok(upstream) => return Ok(upstream),
                Err(e) => {
                    debug!(target = %target.url, error = %e, "Upstream candidate unreachable");
                    last_failure = Some(e);
                }
            }
        }
        Err(RoutingError::Unreachable {
            host: host.to_string(),
            targets: targets.iter().map(|t| t.url.to_string()).collect(),
            cause: last_failure.map_or_else(|| "no candidates".to_string(), |e| e.to_string()),
        })
    }

    /// Connect to a single target.
    pub async fn connect(
        &self,
        target: &Target,
        transport: Transport<'_>,
        hops: u32,
    ) -> Result<Upstream, ConnectFailure> {
        self.stats.attempted.fetch_add(1, Ordering::Relaxed);

        let to_self = self.resolver.self_address().is_self(target);
        let proxy = self
            .forward_proxy
            .as_ref()
            .filter(|p| !to_self && !bypasses_proxy(p, target));

        let tcp = match proxy {
            Some(proxy) => self.tunnel(proxy, target).await?,
            None => self.dial(&target.host, target.port).await?,
        };
        let local_addr = tcp.local_addr().map_err(|e| io_failure(target, e))?;
        let peer_addr = tcp.peer_addr().map_err(|e| io_failure(target, e))?;

        let self_connection = to_self.then(|| {
            self.resolver.record_self_connection(local_addr, hops);
            SelfConnection {
                resolver: self.resolver.clone(),
                local: local_addr,
            }
        });

        let stream = match transport {
            Transport::Tls { alpn } => self.tls.connect(tcp, &target.host, alpn).await?,
            Transport::Plain => UpstreamStream::Plain(tcp),
        };

        self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        debug!(
            target = %target.url,
            peer_addr = %peer_addr,
            via_proxy = proxy.is_some(),
            tls = matches!(transport, Transport::Tls { .. }),
            "Upstream connected"
        );
        Ok(Upstream {
            stream,
            target: target.clone(),
            local_addr,
            peer_addr,
            via_proxy: proxy.is_some(),
            _self_connection: self_connection,
        })
    }

    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, ConnectFailure> {
        let authority = format!("{host}:{port}");
        let stream = match timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(result) => result.map_err(|source| ConnectFailure::Io {
                target: authority,
                source,
            })?,
            Err(_) => return Err(ConnectFailure::Timeout(authority)),
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Open a CONNECT tunnel to `target` through `proxy`.
    async fn tunnel(&self, proxy: &ForwardProxy, target: &Target) -> Result<TcpStream, ConnectFailure> {
        let mut stream = self.dial(&proxy.host, proxy.port).await?;
        let authority = target.authority();

        let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some((user, password)) = &proxy.credentials {
            let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
            request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        request.push_str("\r\n");

        let proxy_name = format!("{}:{}", proxy.host, proxy.port);
        let exchange = async {
            stream.write_all(request.as_bytes()).await?;
            read_response_head(&mut stream).await
        };
        let head = match timeout(self.connect_timeout, exchange).await {
            Ok(result) => result.map_err(|source| ConnectFailure::Io {
                target: proxy_name.clone(),
                source,
            })?,
            Err(_) => return Err(ConnectFailure::Timeout(proxy_name)),
        };

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        let status = match response.parse(&head) {
            Ok(httparse::Status::Complete(_)) => response.code.unwrap_or(0),
            _ => 0,
        };
        if !(200..300).contains(&status) {
            return Err(ConnectFailure::ProxyRefused {
                proxy: proxy_name,
                target: authority,
                status: if status == 0 {
                    "malformed response".to_string()
                } else {
                    format!("{status} {}", response.reason.unwrap_or_default())
                },
            });
        }
        debug!(proxy = %proxy_name, target = %authority, "CONNECT tunnel established");
        Ok(stream)
    }
}

/// Read exactly up to the end of the response head so no tunnelled bytes
/// are consumed.
async fn read_response_head(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_RESPONSE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "proxy response head too large"));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed before answering CONNECT",
            ));
        }
        head.push(byte[0]);
    }
    Ok(head)
}

fn io_failure(target: &Target, source: io::Error) -> ConnectFailure {
    ConnectFailure::Io {
        target: target.authority(),
        source,
    }
}

/// Whether `target` is listed in the proxy's `no_proxy_hosts`, by host or
/// by `host:port`.
pub fn bypasses_proxy(proxy: &ForwardProxy, target: &Target) -> bool {
    let authority = target.authority();
    proxy
        .no_proxy_hosts
        .iter()
        .map(|entry| entry.trim())
        .any(|entry| entry.eq_ignore_ascii_case(&target.host) || entry.eq_ignore_ascii_case(&authority))
}
