//! Contract between the relay and the downstream traffic analyzer.
//!
//! Every directional read becomes one [`CapturedUnit`]. Units of a single
//! connection are delivered in the order they were observed; a request unit
//! always reaches the sink before the response unit paired with it.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{AnalyzerError, ProxyError, RoutingError, TransportError};
use crate::ids::{ConnectionId, UnitId};

/// Direction of a captured unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client to upstream ("request-shaped").
    ClientToServer,
    /// Upstream to client ("response-shaped").
    ServerToClient,
}

impl Direction {
    pub fn is_request(self) -> bool {
        self == Self::ClientToServer
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::ClientToServer => Self::ServerToClient,
            Self::ServerToClient => Self::ClientToServer,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientToServer => f.write_str("client->server"),
            Self::ServerToClient => f.write_str("server->client"),
        }
    }
}

/// Negotiated parameters of the client-facing TLS session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsSessionInfo {
    pub protocol_version: String,
    pub cipher_suite: String,
    pub server_name: Option<String>,
    pub alpn: Option<String>,
    /// DER certificates presented by the client (mutual TLS), leaf first.
    #[serde(skip)]
    pub client_certificates: Vec<Bytes>,
}

/// What a captured unit carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitKind {
    /// Relayed bytes.
    Data,
    /// The request could not be routed.
    RoutingError(RoutingError),
    /// The connection broke while a request was pending.
    TransportError(TransportError),
}

/// One unit of observed traffic.
#[derive(Debug, Clone)]
pub struct CapturedUnit {
    pub id: UnitId,
    pub connection_id: ConnectionId,
    /// Position of this unit within its connection, starting at 0.
    pub sequence: u64,
    pub direction: Direction,
    pub sender: SocketAddr,
    pub receiver: SocketAddr,
    /// Wall-clock time the bytes were read, taken before any analysis.
    pub captured_at: DateTime<Utc>,
    pub bytes: Bytes,
    pub kind: UnitKind,
    /// For response-shaped units: the request unit this one answers.
    /// For error units: the pending request that failed.
    pub paired_with: Option<UnitId>,
    pub tls: Option<Arc<TlsSessionInfo>>,
}

impl CapturedUnit {
    pub fn is_data(&self) -> bool {
        matches!(self.kind, UnitKind::Data)
    }

    pub fn routing_error(&self) -> Option<&RoutingError> {
        match &self.kind {
            UnitKind::RoutingError(e) => Some(e),
            _ => None,
        }
    }

    pub fn transport_error(&self) -> Option<&TransportError> {
        match &self.kind {
            UnitKind::TransportError(e) => Some(e),
            _ => None,
        }
    }
}

/// Downstream consumer of captured units.
#[async_trait]
pub trait TrafficSink: Send + Sync {
    /// Analyze one unit. Errors are reported to exception listeners and never
    /// interrupt relaying.
    async fn on_unit(&self, unit: &CapturedUnit) -> Result<(), AnalyzerError>;
}

/// Receives errors that occurred while handling traffic.
pub trait ExceptionListener: Send + Sync {
    fn on_exception(&self, connection: Option<ConnectionId>, error: &ProxyError);
}

impl<F> ExceptionListener for F
where
    F: Fn(Option<ConnectionId>, &ProxyError) + Send + Sync,
{
    fn on_exception(&self, connection: Option<ConnectionId>, error: &ProxyError) {
        self(connection, error)
    }
}

/// Fan-out over registered exception listeners.
#[derive(Clone, Default)]
pub struct ExceptionListeners {
    listeners: Vec<Arc<dyn ExceptionListener>>,
}

impl ExceptionListeners {
    pub fn push(&mut self, listener: Arc<dyn ExceptionListener>) {
        self.listeners.push(listener);
    }

    /// Report an error; benign disconnects are only logged.
    pub fn report(&self, connection: Option<ConnectionId>, error: &ProxyError) {
        if error.is_benign() {
            debug!(error = %error, "Benign disconnect");
            return;
        }
        warn!(error = %error, "Reporting proxy exception");
        for listener in &self.listeners {
            listener.on_exception(connection, error);
        }
    }
}

/// Sink that logs a one-line summary of every unit.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl TrafficSink for LoggingSink {
    async fn on_unit(&self, unit: &CapturedUnit) -> Result<(), AnalyzerError> {
        debug!(
            unit_id = %unit.id,
            connection_id = %unit.connection_id,
            direction = %unit.direction,
            sender = %unit.sender,
            receiver = %unit.receiver,
            bytes = unit.bytes.len(),
            paired_with = ?unit.paired_with,
            kind = ?unit.kind,
            "Captured unit"
        );
        Ok(())
    }
}

/// In-memory sink keeping every unit for later inspection.
#[derive(Default)]
pub struct RecordingSink {
    units: Mutex<Vec<CapturedUnit>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of all units received so far.
    pub fn units(&self) -> Vec<CapturedUnit> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Wait until `predicate` holds for the recorded units or `timeout` elapses.
    /// Returns the snapshot that satisfied the predicate, if any.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Option<Vec<CapturedUnit>>
    where
        F: Fn(&[CapturedUnit]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let units = self.lock();
                if predicate(&units) {
                    return Some(units.clone());
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CapturedUnit>> {
        self.units.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TrafficSink for RecordingSink {
    async fn on_unit(&self, unit: &CapturedUnit) -> Result<(), AnalyzerError> {
        self.lock().push(unit.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}
