//! Error taxonomy for the proxy.
//!
//! - [`ConfigError`] fails fast at startup or at route/modifier registration.
//! - [`RoutingError`] is captured as a unit of its own and reported.
//! - [`TlsError`] closes the connection; already captured units stay valid.
//! - [`TransportError`] is split into benign disconnects and genuine faults.

use std::fmt::Display;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Invalid or disallowed configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A single field holds an unusable value.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    /// Forward proxy and direct reverse proxy were both configured.
    #[error("`forward_proxy` and `direct_reverse_proxy` are mutually exclusive")]
    ConflictingUpstreamModes,

    /// Credentials are incomplete or unparseable.
    #[error("malformed credentials in `{field}`: {reason}")]
    MalformedCredentials { field: String, reason: String },

    /// A configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Display) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    pub fn credentials(field: impl Into<String>, reason: impl Display) -> Self {
        Self::MalformedCredentials {
            field: field.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failure to find or reach an upstream for a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Nothing in the route table applies to the request.
    #[error("no route matches {host}{path}")]
    NoMatchingRoute { host: String, path: String },

    /// Every candidate target failed to connect in time.
    #[error("no upstream reachable for {host} (tried {}): {cause}", targets.join(", "))]
    Unreachable {
        host: String,
        targets: Vec<String>,
        cause: String,
    },

    /// The request kept being routed back into the proxy.
    #[error("infinite loop detected routing {host} to {target}: {hops} hops exceed limit {limit}")]
    InfiniteLoop {
        host: String,
        target: String,
        hops: u32,
        limit: u32,
    },

    /// A follow-up request on a kept-alive connection resolves to an
    /// upstream other than the one the connection is bound to.
    #[error("{host}{path} does not route to the connection's upstream {upstream}")]
    UpstreamMismatch {
        host: String,
        path: String,
        upstream: String,
    },
}

impl RoutingError {
    /// Host the failed request was addressed to.
    pub fn host(&self) -> &str {
        match self {
            Self::NoMatchingRoute { host, .. }
            | Self::Unreachable { host, .. }
            | Self::InfiniteLoop { host, .. }
            | Self::UpstreamMismatch { host, .. } => host,
        }
    }

    /// Target(s) that were attempted, if routing got that far.
    pub fn target(&self) -> Option<String> {
        match self {
            Self::NoMatchingRoute { .. } => None,
            Self::Unreachable { targets, .. } => Some(targets.join(", ")),
            Self::InfiniteLoop { target, .. } => Some(target.clone()),
            Self::UpstreamMismatch { upstream, .. } => Some(upstream.clone()),
        }
    }

    pub fn is_infinite_loop(&self) -> bool {
        matches!(self, Self::InfiniteLoop { .. })
    }
}

/// TLS handshake or identity failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TlsError {
    #[error("TLS handshake with {peer} timed out")]
    Timeout { peer: String },

    /// The peer's certificate failed validation.
    #[error("untrusted TLS peer {peer}: {reason}")]
    UntrustedPeer { peer: String, reason: String },

    /// No protocol version, cipher suite or group acceptable to both sides.
    #[error("TLS parameters rejected with {peer}: {reason}")]
    Incompatible { peer: String, reason: String },

    #[error("TLS handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    /// Certificate or key material could not be loaded or issued.
    #[error("TLS identity error: {0}")]
    Identity(String),
}

impl TlsError {
    /// Classify a handshake failure surfaced by tokio-rustls.
    pub fn classify(peer: impl Display, err: &io::Error) -> Self {
        use rustls::AlertDescription as Alert;

        let peer = peer.to_string();
        let Some(tls) = err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) else {
            return Self::Handshake {
                peer,
                reason: err.to_string(),
            };
        };
        let reason = tls.to_string();
        match tls {
            rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
                Self::UntrustedPeer { peer, reason }
            }
            rustls::Error::AlertReceived(
                Alert::BadCertificate
                | Alert::UnknownCA
                | Alert::CertificateUnknown
                | Alert::CertificateRevoked
                | Alert::CertificateExpired
                | Alert::UnsupportedCertificate
                | Alert::CertificateRequired,
            ) => Self::UntrustedPeer { peer, reason },
            rustls::Error::PeerIncompatible(_)
            | rustls::Error::AlertReceived(
                Alert::ProtocolVersion | Alert::HandshakeFailure | Alert::InsufficientSecurity,
            ) => Self::Incompatible { peer, reason },
            _ => Self::Handshake { peer, reason },
        }
    }
}

/// Socket-level failure while relaying.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{context}: {message}")]
pub struct TransportError {
    pub context: String,
    pub kind: io::ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(context: impl Into<String>, err: &io::Error) -> Self {
        Self {
            context: context.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// The peer closed its side while a request was still unanswered.
    pub fn closed(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            kind: io::ErrorKind::UnexpectedEof,
            message: "connection closed by peer".to_string(),
        }
    }

    /// Whether this is an ordinary disconnect rather than a genuine fault.
    pub fn is_benign(&self) -> bool {
        if matches!(
            self.kind,
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::NotConnected
        ) {
            return true;
        }
        let message = self.message.to_ascii_lowercase();
        ["close_notify", "connection reset", "broken pipe", "end of file"]
            .iter()
            .any(|needle| message.contains(needle))
    }
}

/// The traffic analyzer rejected or failed on a unit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("analyzer failed: {0}")]
pub struct AnalyzerError(pub String);

/// Any error the proxy reports to exception listeners.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Benign disconnects are logged but not reported.
    pub fn is_benign(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_benign(),
            Self::Io(e) => TransportError::new("io", e).is_benign(),
            _ => false,
        }
    }
}
