//! tapwire proxy core.
//!
//! Accepts TCP connections, tells TLS from plaintext, terminates TLS with
//! configured or freshly issued identities, routes requests to upstreams and
//! relays both directions while handing every read to a traffic analyzer.

pub mod analyzer;
pub mod config;
pub mod error;
pub mod ids;
pub mod proxy;

pub use analyzer::{
    CapturedUnit, Direction, ExceptionListener, LoggingSink, RecordingSink, TlsSessionInfo,
    TrafficSink, UnitKind,
};
pub use config::{ModifierDescriptor, ProxyConfig, RouteSpec};
pub use error::{AnalyzerError, ConfigError, ProxyError, RoutingError, TlsError, TransportError};
pub use ids::{ConnectionId, RouteId, UnitId};
pub use proxy::{
    ConnectionStatus, ModifierRegistry, Proxy, ProxyBuilder, RouteDescriptor, TlsIdentityStore,
};
