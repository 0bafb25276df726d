//! Intercepting proxy implementation.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Acceptor -> Sniffer -> (TLS interceptor) -> Resolver -> Connector -> Upstream
//!                                                          |
//!                                   Relay pipeline <-> modifiers, capture -> analyzer
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tapwire_proxy::{ProxyBuilder, ProxyConfig, RouteSpec};
//!
//! let proxy = ProxyBuilder::new(ProxyConfig::default()).start().await?;
//! proxy.add_route(RouteSpec::new("/api", "http://backend:8080/v2"))?;
//! println!("listening on {}", proxy.local_addr());
//! ```

pub mod capture;
pub mod connector;
pub mod criteria;
pub mod http;
pub mod listener;
pub mod modifier;
pub mod ocsp;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod sniff;
pub mod stream;
pub mod tls;

pub use capture::{CaptureHandle, ClosedBy, ExchangeTracker};
pub use connector::{ConnectFailure, Transport, Upstream, UpstreamConnector};
pub use criteria::Criterion;
pub use listener::{ConnectionAcceptor, ListenerStats};
pub use modifier::{
    ModifierChain, ModifierPlugin, ModifierRegistry, ReplaceBytes, ReplaceContent, UnitContext,
};
pub use registry::{ConnectionInfo, ConnectionRegistry, ConnectionStatus};
pub use relay::{ConnectionState, RelayContext, RelayPipeline, RelaySettings};
pub use router::{
    Resolution, Route, RouteDescriptor, RouteRequest, RouteResolver, RouteScope, RouteTable,
    SelfAddress, Target, HOP_COUNT_HEADER,
};
pub use server::{Proxy, ProxyBuilder};
pub use sniff::{ProtocolSniffer, SniResult, SniffConfig, SniffOutcome, Sniffed};
pub use tls::{CertificateAuthority, ServerIdentity, TlsIdentityStore, TlsInterceptor};
