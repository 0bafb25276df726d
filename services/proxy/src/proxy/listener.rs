//! Accept loop.
//!
//! Every accepted socket is registered, then handed to its own
//! [`RelayPipeline`] task. The number of concurrently relayed connections is
//! bounded; sockets above the bound are closed straight away.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use crate::proxy::registry::ConnectionRegistry;
use crate::proxy::relay::{RelayContext, RelayPipeline};

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Counters for the accept loop.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being relayed.
    pub connections_active: AtomicU64,
    /// Connections that finished.
    pub connections_closed: AtomicU64,
    /// Connections refused because the limit was reached.
    pub connections_rejected: AtomicU64,
}

/// Owns the listening socket and spawns one relay task per connection.
pub struct ConnectionAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<RelayContext>,
    registry: Arc<ConnectionRegistry>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl ConnectionAcceptor {
    pub fn new(
        listener: TcpListener,
        ctx: Arc<RelayContext>,
        registry: Arc<ConnectionRegistry>,
        max_connections: usize,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            ctx,
            registry,
            conn_semaphore: Arc::new(Semaphore::new(max_connections.max(1))),
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept until the task is aborted.
    pub async fn run(self) {
        info!(bind_addr = %self.local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let local_addr = stream.local_addr().unwrap_or(self.local_addr);
                    let guard = self.registry.register(peer_addr, local_addr);
                    let connection_id = guard.id();

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let pipeline = RelayPipeline::new(Arc::clone(&self.ctx), guard, peer_addr, local_addr);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            debug!("Connection accepted");
                            pipeline.run(stream).await;

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!(
                            "connection",
                            connection_id = %connection_id,
                            peer = %peer_addr
                        )),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
