//! Registry of open client connections.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::ids::ConnectionId;

/// Connection status as seen by introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Open,
    /// TLS handshake with the client completed.
    OpenTls,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub client_address: SocketAddr,
    /// Local address the client connected to.
    pub server_address: SocketAddr,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
}

/// Open connections keyed by id. Entries are removed when their
/// [`ConnectionGuard`] drops, whichever way the connection ended.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionInfo>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a newly accepted connection.
    pub fn register(
        self: &Arc<Self>,
        client_address: SocketAddr,
        server_address: SocketAddr,
    ) -> ConnectionGuard {
        let id = ConnectionId::new();
        self.connections.insert(
            id,
            ConnectionInfo {
                id,
                client_address,
                server_address,
                status: ConnectionStatus::Open,
                created_at: Utc::now(),
            },
        );
        ConnectionGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn mark_tls(&self, id: &ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(id) {
            entry.status = ConnectionStatus::OpenTls;
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(id).map(|entry| entry.clone())
    }

    /// Open connections, oldest first, optionally filtered by status.
    pub fn list(&self, status: Option<ConnectionStatus>) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .filter(|entry| status.map_or(true, |s| entry.status == s))
            .map(|entry| entry.clone())
            .collect();
        connections.sort_by_key(|c| c.id);
        connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn remove(&self, id: &ConnectionId) {
        if self.connections.remove(id).is_some() {
            debug!(connection_id = %id, "Connection removed from registry");
        }
    }
}

/// Scoped registration; dropping it removes the connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn mark_tls(&self) {
        self.registry.mark_tls(&self.id);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
