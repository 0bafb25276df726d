//! Route table and route resolution.
//!
//! - Routes match on scheme/host/port from their `from` pattern, an optional
//!   host filter, a segment-aware path prefix, and criteria (any true).
//! - Longer path prefixes win; among equal prefixes the most recently added
//!   route wins.
//! - The matched prefix is stripped and the remainder appended to the
//!   target's path; query strings are merged.
//! - A target that is the proxy itself increments the request's hop count;
//!   exceeding the bound fails with [`RoutingError::InfiniteLoop`].
//!
//! The table is an immutable snapshot behind an `ArcSwap`: resolution never
//! blocks on updates and never sees a partially applied change.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::config::RouteSpec;
use crate::error::{ConfigError, RoutingError};
use crate::ids::RouteId;
use crate::proxy::criteria::Criterion;

/// Header carrying the hop count on requests the proxy sends to itself.
pub const HOP_COUNT_HEADER: &str = "x-tapwire-hop-count";

/// Which kind of client traffic a route applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteScope {
    /// Requests from clients using the proxy explicitly (absolute URI, CONNECT).
    Forward,
    /// Requests addressed to the proxy directly.
    Reverse,
    #[default]
    Any,
}

impl RouteScope {
    fn applies(self, forward: bool) -> bool {
        match self {
            Self::Forward => forward,
            Self::Reverse => !forward,
            Self::Any => true,
        }
    }
}

/// The attributes of an in-flight request that routing looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    /// `http`, `https`, `tcp` or `tls`.
    pub scheme: String,
    /// Lowercased host, without port.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
    pub method: Option<String>,
    pub headers: Vec<(String, String)>,
    /// The client is using the proxy as an explicit forward proxy.
    pub forward: bool,
    /// Times this request already passed through the proxy.
    pub hops: u32,
}

impl RouteRequest {
    pub fn new(scheme: &str, host: Option<&str>, path: &str) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.map(normalize_host),
            port: None,
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query: None,
            method: None,
            headers: Vec::new(),
            forward: false,
            hops: 0,
        }
    }

    /// First header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(match self.scheme.as_str() {
            "https" | "tls" | "wss" => 443,
            _ => 80,
        })
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// The `from` side of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Normalized path prefix; never ends with `/` unless it is the root.
    pub path: String,
}

impl RoutePattern {
    pub fn parse(from: &str) -> Result<Self, ConfigError> {
        let from = from.trim();
        if from.is_empty() {
            return Err(ConfigError::invalid("from", "must not be empty"));
        }
        if from.starts_with('/') {
            return Ok(Self {
                scheme: None,
                host: None,
                port: None,
                path: normalize_prefix(from),
            });
        }

        let (text, explicit_scheme) = if from.contains("://") {
            (from.to_string(), true)
        } else {
            (format!("http://{from}"), false)
        };
        let url = Url::parse(&text)
            .map_err(|e| ConfigError::invalid("from", format!("`{from}` is not a valid authority or path: {e}")))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::invalid("from", format!("`{from}` has no host")))?;
        if host.contains(char::is_whitespace) || host.contains('*') && !host.starts_with("*.") {
            return Err(ConfigError::invalid("from", format!("disallowed hostname `{host}`")));
        }

        Ok(Self {
            scheme: explicit_scheme.then(|| url.scheme().to_string()),
            host: Some(normalize_host(host.trim_start_matches('[').trim_end_matches(']'))),
            port: url.port(),
            path: normalize_prefix(url.path()),
        })
    }

    /// Segment-aware prefix match: `/foo` matches `/foo` and `/foo/x`, not `/foobar`.
    fn matches_path(&self, path: &str) -> bool {
        if self.path == "/" {
            return true;
        }
        match path.strip_prefix(self.path.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Request path with the matched prefix removed, `None` when the path
    /// is outside this pattern.
    fn remainder<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.path == "/" {
            return Some(path);
        }
        if !self.matches_path(path) {
            return None;
        }
        path.strip_prefix(self.path.as_str())
    }

    fn specificity(&self) -> usize {
        if self.path == "/" {
            0
        } else {
            self.path.len()
        }
    }
}

fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.len() > suffix.len() + 1 && host.ends_with(suffix) && {
            let dot = host.len() - suffix.len() - 1;
            host.as_bytes()[dot] == b'.'
        },
        None => pattern == host,
    }
}

/// A concrete upstream to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Full rewritten URL.
    pub url: Url,
    /// Host without IPv6 brackets.
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Target {
    pub fn from_url(url: Url) -> Option<Self> {
        let host = match url.host()? {
            Host::Domain(d) => d.to_string(),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };
        let tls = matches!(url.scheme(), "https" | "tls" | "wss");
        let port = url.port_or_known_default().or_else(|| {
            matches!(url.scheme(), "tcp" | "tls").then_some(if tls { 443 } else { 80 })
        })?;
        Some(Self {
            url,
            host,
            port,
            tls,
        })
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Origin-form request target (`/path?query`).
    pub fn request_target(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        }
    }

    /// Value for the `Host` header: the default port is omitted.
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

/// A route in the table.
#[derive(Debug)]
pub struct Route {
    pub id: RouteId,
    pub from: RoutePattern,
    pub to: Vec<Url>,
    pub criteria: Vec<Criterion>,
    /// Lowercased host patterns (`*.example.com` allowed).
    pub hosts: Vec<String>,
    pub scope: RouteScope,
    pub tls_identity: Option<String>,
    /// Insertion order; later routes win ties.
    seq: u64,
    spec: RouteSpec,
}

impl Route {
    /// Validate a spec into a route.
    pub fn from_spec(spec: RouteSpec) -> Result<Self, ConfigError> {
        let from = RoutePattern::parse(&spec.from)?;
        if spec.to.is_empty() {
            return Err(ConfigError::invalid("to", "at least one target is required"));
        }
        let to = spec
            .to
            .iter()
            .map(|raw| {
                let url = Url::parse(raw)
                    .map_err(|e| ConfigError::invalid("to", format!("`{raw}`: {e}")))?;
                if Target::from_url(url.clone()).is_none() {
                    return Err(ConfigError::invalid("to", format!("`{raw}` has no host or port")));
                }
                Ok(url)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let criteria = spec
            .criteria
            .iter()
            .map(|c| Criterion::parse(c))
            .collect::<Result<Vec<_>, _>>()?;
        let hosts = spec
            .hosts
            .iter()
            .map(|h| {
                let h = normalize_host(h.trim());
                if h.is_empty() || h.contains(char::is_whitespace) || h.contains('/') {
                    Err(ConfigError::invalid("hosts", format!("disallowed hostname `{h}`")))
                } else {
                    Ok(h)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: RouteId::new(),
            from,
            to,
            criteria,
            hosts,
            scope: spec.scope.unwrap_or_default(),
            tls_identity: spec.tls_identity.clone(),
            seq: 0,
            spec,
        })
    }

    /// Whether this route applies to `request`.
    pub fn matches(&self, request: &RouteRequest) -> bool {
        if !self.scope.applies(request.forward) {
            return false;
        }
        if let Some(scheme) = &self.from.scheme {
            if *scheme != request.scheme {
                return false;
            }
        }
        if let Some(host) = &self.from.host {
            if !request.host.as_deref().is_some_and(|h| host_matches(host, h)) {
                return false;
            }
        }
        if let Some(port) = self.from.port {
            if port != request.effective_port() {
                return false;
            }
        }
        if !self.hosts.is_empty()
            && !request
                .host
                .as_deref()
                .is_some_and(|h| self.hosts.iter().any(|p| host_matches(p, h)))
        {
            return false;
        }
        if !self.from.matches_path(&request.path) {
            return false;
        }
        self.criteria.is_empty() || self.criteria.iter().any(|c| c.evaluate(request))
    }

    /// Rewrite `request` against each of this route's targets, in order.
    pub fn rewrite(&self, request: &RouteRequest) -> Vec<Target> {
        let Some(remainder) = self.from.remainder(&request.path) else {
            return Vec::new();
        };
        self.to
            .iter()
            .filter_map(|base| {
                let mut url = base.clone();
                let base_path = base.path().trim_end_matches('/');
                let mut path = format!("{base_path}{remainder}");
                if !path.starts_with('/') {
                    path.insert(0, '/');
                }
                url.set_path(&path);
                let query = match (base.query(), request.query.as_deref()) {
                    (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{a}&{b}")),
                    (Some(a), _) if !a.is_empty() => Some(a.to_string()),
                    (_, Some(b)) if !b.is_empty() => Some(b.to_string()),
                    _ => None,
                };
                url.set_query(query.as_deref());
                Target::from_url(url)
            })
            .collect()
    }

    /// Hosts this route serves, for per-route identity selection.
    pub fn served_hosts(&self) -> Vec<String> {
        let mut hosts = self.hosts.clone();
        if let Some(host) = &self.from.host {
            hosts.push(host.clone());
        }
        hosts
    }

    pub fn descriptor(&self) -> RouteDescriptor {
        RouteDescriptor {
            id: self.id,
            from: self.spec.from.clone(),
            to: self.spec.to.clone(),
            criteria: self.spec.criteria.clone(),
            hosts: self.spec.hosts.clone(),
            scope: self.scope,
            tls_identity: self.tls_identity.clone(),
            is_control: false,
        }
    }
}

/// Route as listed through the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDescriptor {
    pub id: RouteId,
    pub from: String,
    pub to: Vec<String>,
    pub criteria: Vec<String>,
    pub hosts: Vec<String>,
    pub scope: RouteScope,
    pub tls_identity: Option<String>,
    /// The implicit route describing the proxy itself; never matched.
    pub is_control: bool,
}

/// Immutable snapshot of the route table.
#[derive(Debug, Default)]
pub struct RouteSnapshot {
    routes: Vec<Arc<Route>>,
}

impl RouteSnapshot {
    /// Best route for `request`: longest prefix, then most recently added.
    pub fn find(&self, request: &RouteRequest) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .filter(|r| r.matches(request))
            .max_by_key(|r| (r.from.specificity(), r.seq))
            .cloned()
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }
}

/// Route table with lock-free reads and atomic updates.
pub struct RouteTable {
    snapshot: ArcSwap<RouteSnapshot>,
    next_seq: AtomicU64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Validate and add a route.
    pub fn insert(&self, spec: RouteSpec) -> Result<Arc<Route>, ConfigError> {
        let mut route = Route::from_spec(spec)?;
        route.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let route = Arc::new(route);
        self.snapshot.rcu(|current| {
            let mut routes = current.routes.clone();
            routes.push(Arc::clone(&route));
            RouteSnapshot { routes }
        });
        info!(route_id = %route.id, from = %route.spec.from, targets = route.to.len(), "Route added");
        Ok(route)
    }

    /// Remove a route; returns it if it existed.
    pub fn remove(&self, id: &RouteId) -> Option<Arc<Route>> {
        let removed = self.get(id)?;
        self.snapshot.rcu(|current| RouteSnapshot {
            routes: current
                .routes
                .iter()
                .filter(|r| r.id != *id)
                .cloned()
                .collect(),
        });
        info!(route_id = %id, "Route removed");
        Some(removed)
    }

    pub fn get(&self, id: &RouteId) -> Option<Arc<Route>> {
        self.snapshot.load().routes.iter().find(|r| r.id == *id).cloned()
    }

    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.snapshot.load_full()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().routes.is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Addresses under which the proxy reaches itself.
#[derive(Debug, Clone)]
pub struct SelfAddress {
    pub local_addr: SocketAddr,
    /// Extra names resolving to this proxy.
    pub hostnames: Vec<String>,
}

impl SelfAddress {
    pub fn is_self(&self, target: &Target) -> bool {
        if target.port != self.local_addr.port() {
            return false;
        }
        match target.host.parse::<IpAddr>() {
            Ok(ip) => ip.is_loopback() || ip.is_unspecified() || ip == self.local_addr.ip(),
            Err(_) => {
                let host = normalize_host(&target.host);
                host == "localhost" || self.hostnames.iter().any(|h| normalize_host(h) == host)
            }
        }
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Matched route; `None` for forward-proxy pass-through.
    pub route: Option<Arc<Route>>,
    /// Candidates in the order they should be tried.
    pub targets: Vec<Target>,
    /// Hop count to carry on the upstream request.
    pub hops: u32,
    /// The first candidate is the proxy itself.
    pub to_self: bool,
}

/// Resolves requests to upstream targets and detects routing loops.
pub struct RouteResolver {
    table: RouteTable,
    control_id: RouteId,
    self_address: SelfAddress,
    max_hops: u32,
    /// Hop counts of connections the proxy opened to itself, keyed by the
    /// outbound socket's local address (the peer address the acceptor sees).
    inflight_hops: DashMap<SocketAddr, u32>,
}

impl RouteResolver {
    pub fn new(self_address: SelfAddress, max_hops: u32) -> Self {
        Self {
            table: RouteTable::new(),
            control_id: RouteId::new(),
            self_address,
            max_hops,
            inflight_hops: DashMap::new(),
        }
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn self_address(&self) -> &SelfAddress {
        &self.self_address
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    /// All routes plus the implicit control route, oldest first.
    pub fn descriptors(&self) -> Vec<RouteDescriptor> {
        let authority = self.self_address.local_addr;
        let mut out = vec![RouteDescriptor {
            id: self.control_id,
            from: format!("http://{authority}/"),
            to: vec![format!("http://{authority}/")],
            criteria: Vec::new(),
            hosts: Vec::new(),
            scope: RouteScope::Any,
            tls_identity: None,
            is_control: true,
        }];
        out.extend(self.table.snapshot().routes.iter().map(|r| r.descriptor()));
        out
    }

    /// Resolve `request` against the current table.
    pub fn resolve(&self, request: &RouteRequest) -> Result<Resolution, RoutingError> {
        let snapshot = self.table.snapshot();
        let host = request.host.clone().unwrap_or_default();

        let (route, targets) = match snapshot.find(request) {
            Some(route) => {
                let targets = route.rewrite(request);
                debug!(route_id = %route.id, host = %host, path = %request.path, "Route matched");
                (Some(route), targets)
            }
            None if request.forward && request.host.is_some() => {
                (None, self.passthrough(request).into_iter().collect())
            }
            None => {
                return Err(RoutingError::NoMatchingRoute {
                    host,
                    path: request.path.clone(),
                })
            }
        };

        let Some(first) = targets.first() else {
            return Err(RoutingError::NoMatchingRoute {
                host,
                path: request.path.clone(),
            });
        };

        let to_self = self.self_address.is_self(first);
        let hops = if to_self { request.hops + 1 } else { request.hops };
        if hops > self.max_hops {
            warn!(host = %host, target = %first.url, hops, limit = self.max_hops, "Routing loop detected");
            return Err(RoutingError::InfiniteLoop {
                host,
                target: first.url.to_string(),
                hops,
                limit: self.max_hops,
            });
        }

        Ok(Resolution {
            route,
            targets,
            hops,
            to_self,
        })
    }

    fn passthrough(&self, request: &RouteRequest) -> Option<Target> {
        let host = request.host.as_deref()?;
        let host = if host.contains(':') { format!("[{host}]") } else { host.to_string() };
        let mut url = Url::parse(&format!("{}://{}:{}", request.scheme, host, request.effective_port())).ok()?;
        url.set_path(&request.path);
        url.set_query(request.query.as_deref());
        Target::from_url(url)
    }

    /// Remember the hop count of a connection the proxy opened to itself.
    pub fn record_self_connection(&self, local: SocketAddr, hops: u32) {
        self.inflight_hops.insert(local, hops);
    }

    /// Hop count inherited by an accepted connection, if it came from this proxy.
    pub fn take_inherited_hops(&self, peer: SocketAddr) -> u32 {
        self.inflight_hops.remove(&peer).map(|(_, hops)| hops).unwrap_or(0)
    }

    pub fn forget_self_connection(&self, local: &SocketAddr) {
        self.inflight_hops.remove(local);
    }
}
