//! Per-connection hand-off of captured traffic to the analyzer.
//!
//! The relay pushes events into a bounded queue drained by one dispatcher
//! task per connection, so units of a connection reach the sink in the order
//! they were read. In blocking mode the relay waits for the sink to finish a
//! unit before forwarding it.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};

use crate::analyzer::{
    CapturedUnit, Direction, ExceptionListeners, TlsSessionInfo, TrafficSink, UnitKind,
};
use crate::error::{ProxyError, RoutingError, TransportError};
use crate::ids::{ConnectionId, UnitId};

/// Side of the connection that went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Upstream,
}

#[derive(Debug)]
enum CaptureEvent {
    Tls(Arc<TlsSessionInfo>),
    Data {
        direction: Direction,
        sender: SocketAddr,
        receiver: SocketAddr,
        bytes: Bytes,
        captured_at: DateTime<Utc>,
        ack: Option<oneshot::Sender<()>>,
    },
    RoutingFailure {
        error: RoutingError,
        sender: SocketAddr,
        receiver: SocketAddr,
        captured_at: DateTime<Utc>,
    },
    Closed {
        by: ClosedBy,
        error: Option<TransportError>,
        sender: SocketAddr,
        receiver: SocketAddr,
    },
}

/// Pairs request-shaped units with the response-shaped units that follow.
///
/// A run of client-to-server units is one exchange, identified by its first
/// unit. The server-to-client units that follow answer it.
#[derive(Debug, Default)]
pub struct ExchangeTracker {
    /// Request still waiting for its first response unit.
    pending: Option<UnitId>,
    /// Request the current response run answers.
    answering: Option<UnitId>,
    last: Option<Direction>,
}

impl ExchangeTracker {
    /// Record a data unit; returns the request a response unit answers.
    pub fn observe(&mut self, direction: Direction, id: UnitId) -> Option<UnitId> {
        let continues_run = self.last == Some(direction);
        self.last = Some(direction);
        match direction {
            Direction::ClientToServer => {
                if !continues_run || self.pending.is_none() {
                    self.pending = Some(id);
                }
                None
            }
            Direction::ServerToClient => {
                if let Some(request) = self.pending.take() {
                    self.answering = Some(request);
                }
                self.answering
            }
        }
    }

    /// The unanswered request, if any.
    pub fn pending(&self) -> Option<UnitId> {
        self.pending
    }

    /// Resolve the pending request with a failure.
    pub fn fail(&mut self) -> Option<UnitId> {
        self.pending.take()
    }

    /// Drop the pending request without reporting it.
    pub fn discard(&mut self) {
        self.pending = None;
    }
}

/// Per-connection capture queue handle owned by the relay.
pub struct CaptureHandle {
    tx: mpsc::Sender<CaptureEvent>,
    blocking: bool,
    task: JoinHandle<()>,
}

impl CaptureHandle {
    /// Start the dispatcher for one connection.
    pub fn spawn(
        connection_id: ConnectionId,
        sink: Arc<dyn TrafficSink>,
        listeners: ExceptionListeners,
        capacity: usize,
        blocking: bool,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dispatcher = Dispatcher {
            connection_id,
            sink,
            listeners,
            sequence: 0,
            tracker: ExchangeTracker::default(),
            tls: None,
        };
        let span = tracing::debug_span!("capture", connection_id = %connection_id);
        let task = tokio::spawn(dispatcher.run(rx).instrument(span));
        Self { tx, blocking, task }
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Attach the client TLS session to every following unit.
    pub async fn tls(&self, info: TlsSessionInfo) {
        self.send(CaptureEvent::Tls(Arc::new(info))).await;
    }

    /// Hand one read to the analyzer.
    ///
    /// `captured_at` must be taken when the bytes were read. In blocking mode
    /// this returns once the sink has finished with the unit.
    pub async fn data(
        &self,
        direction: Direction,
        sender: SocketAddr,
        receiver: SocketAddr,
        bytes: Bytes,
        captured_at: DateTime<Utc>,
    ) {
        let (ack, done) = if self.blocking {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.send(CaptureEvent::Data {
            direction,
            sender,
            receiver,
            bytes,
            captured_at,
            ack,
        })
        .await;
        if let Some(done) = done {
            // A dropped sender means the dispatcher is gone; keep relaying.
            let _ = done.await;
        }
    }

    /// Record a request that could not be routed.
    pub async fn routing_failure(&self, error: RoutingError, sender: SocketAddr, receiver: SocketAddr) {
        self.send(CaptureEvent::RoutingFailure {
            error,
            sender,
            receiver,
            captured_at: Utc::now(),
        })
        .await;
    }

    /// Record the end of the connection.
    pub async fn closed(
        &self,
        by: ClosedBy,
        error: Option<TransportError>,
        sender: SocketAddr,
        receiver: SocketAddr,
    ) {
        self.send(CaptureEvent::Closed {
            by,
            error,
            sender,
            receiver,
        })
        .await;
    }

    /// Close the queue and wait until every queued unit was delivered.
    pub async fn finish(self) {
        let Self { tx, task, .. } = self;
        drop(tx);
        let _ = task.await;
    }

    async fn send(&self, event: CaptureEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("Capture dispatcher stopped; dropping event");
        }
    }
}

struct Dispatcher {
    connection_id: ConnectionId,
    sink: Arc<dyn TrafficSink>,
    listeners: ExceptionListeners,
    sequence: u64,
    tracker: ExchangeTracker,
    tls: Option<Arc<TlsSessionInfo>>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<CaptureEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                CaptureEvent::Tls(info) => self.tls = Some(info),
                CaptureEvent::Data {
                    direction,
                    sender,
                    receiver,
                    bytes,
                    captured_at,
                    ack,
                } => {
                    let id = UnitId::new();
                    let paired_with = self.tracker.observe(direction, id);
                    let unit = self.unit(id, direction, sender, receiver, captured_at, bytes, UnitKind::Data, paired_with);
                    self.deliver(unit).await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                CaptureEvent::RoutingFailure {
                    error,
                    sender,
                    receiver,
                    captured_at,
                } => {
                    let paired_with = self.tracker.fail();
                    let unit = self.unit(
                        UnitId::new(),
                        Direction::ServerToClient,
                        sender,
                        receiver,
                        captured_at,
                        Bytes::new(),
                        UnitKind::RoutingError(error.clone()),
                        paired_with,
                    );
                    self.deliver(unit).await;
                    self.listeners
                        .report(Some(self.connection_id), &ProxyError::Routing(error));
                }
                CaptureEvent::Closed {
                    by,
                    error,
                    sender,
                    receiver,
                } => self.closed(by, error, sender, receiver).await,
            }
        }
    }

    async fn closed(
        &mut self,
        by: ClosedBy,
        error: Option<TransportError>,
        sender: SocketAddr,
        receiver: SocketAddr,
    ) {
        match by {
            ClosedBy::Client => {
                self.tracker.discard();
                if let Some(error) = error {
                    self.listeners
                        .report(Some(self.connection_id), &ProxyError::Transport(error));
                }
            }
            ClosedBy::Upstream => {
                let Some(request) = self.tracker.fail() else {
                    if let Some(error) = error {
                        self.listeners
                            .report(Some(self.connection_id), &ProxyError::Transport(error));
                    }
                    return;
                };
                let error = error.unwrap_or_else(|| TransportError::closed("upstream read"));
                let unit = self.unit(
                    UnitId::new(),
                    Direction::ServerToClient,
                    sender,
                    receiver,
                    Utc::now(),
                    Bytes::new(),
                    UnitKind::TransportError(error.clone()),
                    Some(request),
                );
                self.deliver(unit).await;
                self.listeners
                    .report(Some(self.connection_id), &ProxyError::Transport(error));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn unit(
        &mut self,
        id: UnitId,
        direction: Direction,
        sender: SocketAddr,
        receiver: SocketAddr,
        captured_at: DateTime<Utc>,
        bytes: Bytes,
        kind: UnitKind,
        paired_with: Option<UnitId>,
    ) -> CapturedUnit {
        let sequence = self.sequence;
        self.sequence += 1;
        CapturedUnit {
            id,
            connection_id: self.connection_id,
            sequence,
            direction,
            sender,
            receiver,
            captured_at,
            bytes,
            kind,
            paired_with,
            tls: self.tls.clone(),
        }
    }

    async fn deliver(&self, unit: CapturedUnit) {
        if let Err(e) = self.sink.on_unit(&unit).await {
            self.listeners
                .report(Some(self.connection_id), &ProxyError::Analyzer(e));
        }
    }
}
