//! Per-connection relay.
//!
//! Each accepted socket is driven through
//! `Accepted -> Sniffing -> (TlsHandshake) -> Routing -> Relaying -> Closed`
//! by one task. While relaying, every read in either direction is one unit:
//! it passes through the modifier chain, is handed to the capture queue and
//! then written to the other side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::analyzer::{Direction, ExceptionListeners, TrafficSink};
use crate::error::{ProxyError, RoutingError, TransportError};
use crate::proxy::capture::{CaptureHandle, ClosedBy};
use crate::proxy::connector::{Upstream, UpstreamConnector};
use crate::proxy::http::{read_request_head, HeadParse, RequestHead, CONNECT_ESTABLISHED};
use crate::proxy::modifier::{ModifierChain, ModifierSnapshot, UnitContext};
use crate::proxy::registry::ConnectionGuard;
use crate::proxy::router::{Route, RouteRequest, RouteResolver, Target};
use crate::proxy::sniff::{ProtocolSniffer, SniffConfig, SniffOutcome, DEFAULT_MAX_SNIFF_BYTES};
use crate::proxy::stream::{abort, ClientStream, Rewind};
use crate::proxy::tls::TlsInterceptor;

const READ_BUFFER: usize = 16 * 1024;

/// Lifecycle of a proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Sniffing,
    TlsHandshake,
    Routing,
    Relaying,
    Closed,
}

/// Per-connection knobs taken from configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub activate_tls_termination: bool,
    /// Forward a unit only after the analyzer has finished with it.
    pub blocking_analysis: bool,
    pub sniff_timeout: Duration,
    pub head_timeout: Duration,
    /// How long the upstream may keep answering after the client half-closed.
    pub linger: Duration,
    pub capture_queue_capacity: usize,
    /// Fixed upstream for direct reverse-proxy mode.
    pub direct: Option<Target>,
}

/// Collaborators shared by every connection of a proxy.
pub struct RelayContext {
    pub resolver: Arc<RouteResolver>,
    pub connector: Arc<UpstreamConnector>,
    pub tls: Arc<TlsInterceptor>,
    pub modifiers: Arc<ModifierChain>,
    pub sink: Arc<dyn TrafficSink>,
    pub listeners: ExceptionListeners,
    pub settings: RelaySettings,
}

/// Client side after sniffing and optional TLS termination.
struct Session {
    client: Rewind<ClientStream>,
    /// Client TLS was terminated here.
    tls: bool,
    /// Client TLS is relayed as opaque bytes.
    passthrough: bool,
    sni: Option<String>,
    /// Protocol negotiated with the client, offered again upstream.
    alpn: Option<Vec<u8>>,
}

/// What follow-up request heads on a routed HTTP connection are rewritten
/// against.
struct Binding {
    route: Option<Arc<Route>>,
    /// Authority of the connected upstream.
    authority: String,
    tls: bool,
    sni: Option<String>,
    tunnel: Option<(String, u16)>,
    hops: u32,
    to_self: bool,
}

/// Why a direction stopped before its reader reached EOF.
enum Fault {
    Io { by: ClosedBy, error: TransportError },
    /// A follow-up request could not go to the bound upstream. Already
    /// captured as a routing failure.
    Misrouted,
}

impl Fault {
    fn read(direction: Direction, err: &std::io::Error) -> Self {
        match direction {
            Direction::ClientToServer => Self::Io {
                by: ClosedBy::Client,
                error: TransportError::new("client read", err),
            },
            Direction::ServerToClient => Self::Io {
                by: ClosedBy::Upstream,
                error: TransportError::new("upstream read", err),
            },
        }
    }

    fn write(direction: Direction, err: &std::io::Error) -> Self {
        match direction {
            Direction::ClientToServer => Self::Io {
                by: ClosedBy::Upstream,
                error: TransportError::new("upstream write", err),
            },
            Direction::ServerToClient => Self::Io {
                by: ClosedBy::Client,
                error: TransportError::new("client write", err),
            },
        }
    }
}

/// Drives one accepted connection.
pub struct RelayPipeline {
    ctx: Arc<RelayContext>,
    connection: ConnectionGuard,
    peer: SocketAddr,
    local: SocketAddr,
    state: ConnectionState,
}

impl RelayPipeline {
    pub fn new(ctx: Arc<RelayContext>, connection: ConnectionGuard, peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            ctx,
            connection,
            peer,
            local,
            state: ConnectionState::Accepted,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run the connection to completion. Errors are reported to the
    /// exception listeners; the registry entry goes away on return.
    pub async fn run(mut self, tcp: TcpStream) {
        let connection_id = self.connection.id();
        let settings = &self.ctx.settings;
        let capture = CaptureHandle::spawn(
            connection_id,
            self.ctx.sink.clone(),
            self.ctx.listeners.clone(),
            settings.capture_queue_capacity,
            settings.blocking_analysis,
        );

        if let Err(e) = self.drive(tcp, &capture).await {
            self.ctx.listeners.report(Some(connection_id), &e);
        }
        self.enter(ConnectionState::Closed);

        let Self { connection, .. } = self;
        drop(connection);
        capture.finish().await;
    }

    fn enter(&mut self, next: ConnectionState) {
        trace!(from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    fn sniffer(&self, first_read_timeout: Duration) -> ProtocolSniffer {
        ProtocolSniffer::with_config(SniffConfig {
            timeout: self.ctx.settings.sniff_timeout,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
            first_read_timeout: Some(first_read_timeout),
        })
    }

    async fn drive(&mut self, tcp: TcpStream, capture: &CaptureHandle) -> Result<(), ProxyError> {
        let settings = self.ctx.settings.clone();

        self.enter(ConnectionState::Sniffing);
        // Direct mode may bridge server-speaks-first protocols, so it stops
        // waiting for the client early.
        let first_read = if settings.direct.is_some() {
            settings.sniff_timeout
        } else {
            settings.head_timeout
        };
        let mut raw = Rewind::new(tcp);
        let outcome = self
            .sniffer(first_read)
            .sniff(&mut raw)
            .await
            .map_err(|e| TransportError::new("sniff", &e))?;
        if outcome.eof {
            debug!("Client closed before sending anything");
            return Ok(());
        }

        let mut session = self.secure(raw, &outcome, None, capture).await?;

        if let Some(direct) = settings.direct {
            return self.relay_direct(session, direct, capture).await;
        }

        let mut tunnel: Option<(String, u16)> = None;
        loop {
            self.enter(ConnectionState::Routing);
            let (parsed, mut buffer) =
                read_request_head(&mut session.client, settings.sniff_timeout, settings.head_timeout)
                .await
                .map_err(|e| TransportError::new("client read", &e))?;
            let captured_at = Utc::now();

            match parsed {
                HeadParse::Complete(head) if head.is_connect() && tunnel.is_none() && !session.passthrough => {
                    let Some(authority) = head.connect_authority() else {
                        session
                            .client
                            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                            .await
                            .map_err(|e| TransportError::new("client write", &e))?;
                        return Ok(());
                    };
                    session
                        .client
                        .write_all(CONNECT_ESTABLISHED)
                        .await
                        .map_err(|e| TransportError::new("client write", &e))?;
                    debug!(authority = %format!("{}:{}", authority.0, authority.1), "CONNECT tunnel opened");

                    let leftover = buffer.split_off(head.len).freeze();
                    match self.open_tunnel(session, leftover, &authority, capture).await? {
                        Some(next) => session = next,
                        None => return Ok(()),
                    }
                    tunnel = Some(authority);
                }
                parsed => {
                    return self
                        .route_and_relay(session, parsed, buffer, captured_at, tunnel, capture)
                        .await;
                }
            }
        }
    }

    /// Terminate TLS when the client speaks it and termination is enabled.
    async fn secure(
        &mut self,
        raw: Rewind<TcpStream>,
        outcome: &SniffOutcome,
        fallback_host: Option<&str>,
        capture: &CaptureHandle,
    ) -> Result<Session, ProxyError> {
        if !outcome.is_tls() {
            return Ok(Session {
                client: Rewind::new(ClientStream::Plain(raw)),
                tls: false,
                passthrough: false,
                sni: fallback_host.map(str::to_string),
                alpn: None,
            });
        }

        let sni = outcome
            .sni()
            .hostname()
            .map(str::to_string)
            .or_else(|| fallback_host.map(str::to_string));
        if !self.ctx.settings.activate_tls_termination {
            debug!(sni = ?sni, "Relaying TLS without termination");
            return Ok(Session {
                client: Rewind::new(ClientStream::Plain(raw)),
                tls: false,
                passthrough: true,
                sni,
                alpn: None,
            });
        }

        self.enter(ConnectionState::TlsHandshake);
        let (stream, info) = self.ctx.tls.accept(raw, self.peer, fallback_host).await?;
        self.connection.mark_tls();
        let sni = info.server_name.clone().or(sni);
        let alpn = info.alpn.clone().map(String::into_bytes);
        capture.tls(info).await;
        Ok(Session {
            client: Rewind::new(stream),
            tls: true,
            passthrough: false,
            sni,
            alpn,
        })
    }

    /// Continue inside an accepted `CONNECT` tunnel.
    async fn open_tunnel(
        &mut self,
        session: Session,
        leftover: Bytes,
        authority: &(String, u16),
        capture: &CaptureHandle,
    ) -> Result<Option<Session>, ProxyError> {
        let (unread, stream) = session.client.into_parts();
        match stream {
            ClientStream::Plain(mut raw) => {
                raw.rewind(unread);
                raw.rewind(leftover);
                let outcome = self
                    .sniffer(self.ctx.settings.head_timeout)
                    .sniff(&mut raw)
                    .await
                    .map_err(|e| TransportError::new("sniff", &e))?;
                if outcome.eof {
                    return Ok(None);
                }
                self.secure(raw, &outcome, Some(&authority.0), capture).await.map(Some)
            }
            tls @ ClientStream::Tls(_) => {
                let mut client = Rewind::new(tls);
                client.rewind(unread);
                client.rewind(leftover);
                Ok(Some(Session {
                    client,
                    tls: session.tls,
                    passthrough: false,
                    sni: session.sni,
                    alpn: session.alpn,
                }))
            }
        }
    }

    async fn route_and_relay(
        &mut self,
        session: Session,
        parsed: HeadParse,
        buffer: BytesMut,
        captured_at: DateTime<Utc>,
        tunnel: Option<(String, u16)>,
        capture: &CaptureHandle,
    ) -> Result<(), ProxyError> {
        let inherited = self.ctx.resolver.take_inherited_hops(self.peer);

        let (request, head) = match parsed {
            HeadParse::Complete(head) if !session.passthrough => {
                let mut request = head.to_route_request(session.tls, session.sni.as_deref(), tunnel.as_ref());
                request.hops = head.hop_count().max(inherited);
                (request, Some(head))
            }
            _ => {
                let scheme = if session.tls || session.passthrough { "https" } else { "http" };
                let host = tunnel
                    .as_ref()
                    .map(|(h, _)| h.as_str())
                    .or(session.sni.as_deref());
                let mut request = RouteRequest::new(scheme, host, "/");
                request.port = tunnel.as_ref().map(|(_, p)| *p);
                request.forward = tunnel.is_some();
                request.hops = inherited;
                (request, None)
            }
        };
        let host = request.host.clone().unwrap_or_default();

        let resolution = match self.ctx.resolver.resolve(&request) {
            Ok(resolution) => resolution,
            Err(RoutingError::NoMatchingRoute { .. }) if buffer.is_empty() => {
                debug!("Idle connection matched no route");
                return Ok(());
            }
            Err(error) => return self.fail_routing(session, buffer, captured_at, error, capture).await,
        };

        let upstream = match self
            .ctx
            .connector
            .connect_first(
                &host,
                &resolution.targets,
                !session.passthrough,
                session.alpn.as_deref(),
                resolution.hops,
            )
            .await
        {
            Ok(upstream) => upstream,
            Err(error) => return self.fail_routing(session, buffer, captured_at, error, capture).await,
        };
        info!(
            route_id = ?resolution.route.as_ref().map(|r| r.id.to_string()),
            host = %host,
            target = %upstream.target.url,
            hops = resolution.hops,
            "Connection routed"
        );

        let hop_header = resolution.to_self.then_some(resolution.hops);
        let (first, binding) = match head {
            Some(head) => {
                let mut bytes = head.rewrite(&upstream.target, hop_header);
                bytes.extend_from_slice(&buffer[head.len..]);
                let binding = Binding {
                    route: resolution.route.clone(),
                    authority: upstream.target.authority(),
                    tls: session.tls,
                    sni: session.sni.clone(),
                    tunnel,
                    hops: resolution.hops,
                    to_self: resolution.to_self,
                };
                (Bytes::from(bytes), Some(binding))
            }
            None => (buffer.freeze(), None),
        };

        self.relay(session, upstream, first, captured_at, binding, capture).await
    }

    async fn relay_direct(
        &mut self,
        session: Session,
        target: Target,
        capture: &CaptureHandle,
    ) -> Result<(), ProxyError> {
        self.enter(ConnectionState::Routing);
        let resolver = &self.ctx.resolver;
        let mut hops = resolver.take_inherited_hops(self.peer);
        if resolver.self_address().is_self(&target) {
            hops += 1;
            if hops > resolver.max_hops() {
                let error = RoutingError::InfiniteLoop {
                    host: target.host.clone(),
                    target: target.url.to_string(),
                    hops,
                    limit: resolver.max_hops(),
                };
                return self.fail_routing(session, BytesMut::new(), Utc::now(), error, capture).await;
            }
        }

        let targets = [target];
        let upstream = match self
            .ctx
            .connector
            .connect_first(&targets[0].host, &targets, !session.passthrough, session.alpn.as_deref(), hops)
            .await
        {
            Ok(upstream) => upstream,
            Err(error) => return self.fail_routing(session, BytesMut::new(), Utc::now(), error, capture).await,
        };
        self.relay(session, upstream, Bytes::new(), Utc::now(), None, capture).await
    }

    /// Capture what was read, record the failure and reset the client.
    async fn fail_routing(
        &mut self,
        session: Session,
        buffer: BytesMut,
        captured_at: DateTime<Utc>,
        error: RoutingError,
        capture: &CaptureHandle,
    ) -> Result<(), ProxyError> {
        warn!(host = %error.host(), error = %error, "Routing failed");
        if !buffer.is_empty() {
            capture
                .data(Direction::ClientToServer, self.peer, self.local, buffer.freeze(), captured_at)
                .await;
        }
        capture.routing_failure(error, self.local, self.peer).await;
        abort(session.client.get_ref().tcp());
        Ok(())
    }

    async fn relay(
        &mut self,
        mut session: Session,
        mut upstream: Upstream,
        first: Bytes,
        captured_at: DateTime<Utc>,
        binding: Option<Binding>,
        capture: &CaptureHandle,
    ) -> Result<(), ProxyError> {
        self.enter(ConnectionState::Relaying);
        let client_addr = self.peer;
        let upstream_addr = upstream.peer_addr;
        let modifiers = self.ctx.modifiers.snapshot();
        let linger = self.ctx.settings.linger;
        let pump = Pump {
            ctx: &self.ctx,
            connection_id: self.connection.id(),
            modifiers: &modifiers,
            capture,
            tls: session.tls,
        };

        let ended: Result<ClosedBy, Fault> = {
            let (mut client_r, mut client_w) = tokio::io::split(&mut session.client);
            let (mut upstream_r, mut upstream_w) = tokio::io::split(&mut upstream.stream);

            let first_sent = if first.is_empty() {
                Ok(())
            } else {
                pump.forward(
                    Direction::ClientToServer,
                    first,
                    captured_at,
                    (client_addr, upstream_addr),
                    &mut upstream_w,
                    None,
                )
                .await
            };

            match first_sent {
                Err(fault) => Err(fault),
                Ok(()) => {
                    let to_upstream = pump.run(
                        Direction::ClientToServer,
                        &mut client_r,
                        &mut upstream_w,
                        (client_addr, upstream_addr),
                        binding.as_ref(),
                    );
                    let to_client = pump.run(
                        Direction::ServerToClient,
                        &mut upstream_r,
                        &mut client_w,
                        (upstream_addr, client_addr),
                        None,
                    );
                    tokio::pin!(to_upstream, to_client);

                    tokio::select! {
                        sent = &mut to_upstream => match sent {
                            Ok(()) => match tokio::time::timeout(linger, &mut to_client).await {
                                Ok(Ok(())) => Ok(ClosedBy::Upstream),
                                Ok(Err(fault)) => Err(fault),
                                Err(_) => Ok(ClosedBy::Client),
                            },
                            Err(fault) => Err(fault),
                        },
                        received = &mut to_client => received.map(|()| ClosedBy::Upstream),
                    }
                }
            }
        };

        let (by, error) = match ended {
            Ok(by) => (by, None),
            Err(Fault::Io { by, error }) => (by, Some(error)),
            Err(Fault::Misrouted) => {
                debug!("Relay stopped on a request for another upstream");
                abort(session.client.get_ref().tcp());
                return Ok(());
            }
        };

        debug!(closed_by = ?by, error = ?error.as_ref().map(|e| e.to_string()), "Relay finished");
        let (sender, receiver) = match by {
            ClosedBy::Client => (client_addr, upstream_addr),
            ClosedBy::Upstream => (upstream_addr, client_addr),
        };
        // An upstream reset is passed on as a reset.
        let reset_client = by == ClosedBy::Upstream && error.is_some();
        capture.closed(by, error, sender, receiver).await;
        if reset_client {
            abort(session.client.get_ref().tcp());
        } else {
            let _ = session.client.shutdown().await;
        }
        Ok(())
    }
}

/// Moves bytes in one direction.
struct Pump<'a> {
    ctx: &'a RelayContext,
    connection_id: crate::ids::ConnectionId,
    modifiers: &'a ModifierSnapshot,
    capture: &'a CaptureHandle,
    tls: bool,
}

impl Pump<'_> {
    /// Relay until the reader reaches EOF, then half-close the writer.
    async fn run<R, W>(
        &self,
        direction: Direction,
        reader: &mut R,
        writer: &mut W,
        addrs: (SocketAddr, SocketAddr),
        binding: Option<&Binding>,
    ) -> Result<(), Fault>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER);
        // Set while an incomplete follow-up request head is held back.
        let mut held_since: Option<DateTime<Utc>> = None;
        loop {
            buffer.reserve(READ_BUFFER);
            let read = match held_since {
                Some(_) => tokio::time::timeout(self.ctx.settings.head_timeout, reader.read_buf(&mut buffer))
                    .await
                    .ok(),
                None => Some(reader.read_buf(&mut buffer).await),
            };
            let read = match read {
                Some(read) => read.map_err(|e| Fault::read(direction, &e))?,
                None => {
                    trace!(held = buffer.len(), "Request head never completed, forwarding as is");
                    let captured_at = held_since.take().unwrap_or_else(Utc::now);
                    self.forward(direction, buffer.split().freeze(), captured_at, addrs, writer, None)
                        .await?;
                    continue;
                }
            };
            let captured_at = held_since.take().unwrap_or_else(Utc::now);
            if read == 0 {
                if !buffer.is_empty() {
                    self.forward(direction, buffer.split().freeze(), captured_at, addrs, writer, None)
                        .await?;
                }
                let _ = writer.shutdown().await;
                return Ok(());
            }
            if binding.is_some() && RequestHead::parse(&buffer) == HeadParse::Partial {
                held_since = Some(captured_at);
                continue;
            }
            let bytes = buffer.split().freeze();
            self.forward(direction, bytes, captured_at, addrs, writer, binding)
                .await?;
        }
    }

    /// Rewrite, modify, capture and write one unit.
    async fn forward<W>(
        &self,
        direction: Direction,
        bytes: Bytes,
        captured_at: DateTime<Utc>,
        (sender, receiver): (SocketAddr, SocketAddr),
        writer: &mut W,
        binding: Option<&Binding>,
    ) -> Result<(), Fault>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = match binding.map(|binding| self.retarget(binding, &bytes)) {
            None | Some(Ok(None)) => bytes,
            Some(Ok(Some(rewritten))) => rewritten,
            Some(Err(error)) => {
                warn!(error = %error, "Follow-up request cannot use the bound upstream");
                self.capture
                    .data(direction, sender, receiver, bytes, captured_at)
                    .await;
                self.capture.routing_failure(error, receiver, sender).await;
                return Err(Fault::Misrouted);
            }
        };
        let bytes = self
            .modifiers
            .apply(&UnitContext {
                connection_id: self.connection_id,
                direction,
                bytes: &bytes,
                tls: self.tls,
            })
            .unwrap_or(bytes);

        self.capture
            .data(direction, sender, receiver, bytes.clone(), captured_at)
            .await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| Fault::write(direction, &e))?;
        writer.flush().await.map_err(|e| Fault::write(direction, &e))
    }

    /// Rewrite a follow-up request head for the bound upstream.
    ///
    /// The bound route is reused while it still matches; otherwise the
    /// request is resolved afresh and must land on the same upstream.
    /// `Ok(None)` means `bytes` carry no complete request head.
    fn retarget(&self, binding: &Binding, bytes: &Bytes) -> Result<Option<Bytes>, RoutingError> {
        let HeadParse::Complete(head) = RequestHead::parse(bytes) else {
            return Ok(None);
        };
        let mut request = head.to_route_request(binding.tls, binding.sni.as_deref(), binding.tunnel.as_ref());
        // Hops as they were before this connection's own hop was counted.
        request.hops = binding.hops.saturating_sub(u32::from(binding.to_self));
        let candidates = match &binding.route {
            Some(route) if route.matches(&request) => route.rewrite(&request),
            _ => self.ctx.resolver.resolve(&request)?.targets,
        };
        let Some(target) = candidates
            .into_iter()
            .find(|t| t.authority() == binding.authority)
        else {
            return Err(RoutingError::UpstreamMismatch {
                host: request.host.unwrap_or_default(),
                path: request.path,
                upstream: binding.authority.clone(),
            });
        };

        let mut out = head.rewrite(&target, binding.to_self.then_some(binding.hops));
        out.extend_from_slice(&bytes[head.len..]);
        Ok(Some(Bytes::from(out)))
    }
}
