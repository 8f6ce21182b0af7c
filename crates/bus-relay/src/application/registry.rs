//! Connection registry: the process-scoped table of live bus connections.
//!
//! The registry owns every connection from accept to close.  Each entry
//! holds the sending half of the connection's outbound queue, a pending-bytes
//! counter used for backpressure, and a close signal watched by the
//! connection's read and write tasks.
//!
//! # Atomicity
//!
//! All state sits behind one `std::sync::Mutex` that is never held across an
//! `.await`.  [`ConnectionRegistry::enqueue_all`] walks the table and enqueues
//! under a single lock acquisition, so a broadcast sees exactly one snapshot
//! and a concurrent connect or disconnect lands entirely before or after it.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Opaque connection identifier.  Monotonically increasing, never reused.
pub type ConnectionId = u64;

/// An encoded frame shared by every connection it is queued on.
pub type Frame = Arc<[u8]>;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Per-connection enqueue failure.  Recorded, never fatal to a broadcast.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("connection {id} is a slow consumer ({pending} bytes pending, limit {limit})")]
    SlowConsumer {
        id: ConnectionId,
        pending: usize,
        limit: usize,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentifyError {
    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    #[error("connection {0} is already identified")]
    AlreadyIdentified(ConnectionId),
}

/// Why a connection was closed.  Logged; has no other effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    PeerClosed,
    ReadFailed(String),
    WriteFailed(String),
    Protocol(String),
    DuplicateHello,
    SlowConsumer,
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => f.write_str("peer closed the connection"),
            DisconnectReason::ReadFailed(e) => write!(f, "read failed: {e}"),
            DisconnectReason::WriteFailed(e) => write!(f, "write failed: {e}"),
            DisconnectReason::Protocol(e) => write!(f, "protocol error: {e}"),
            DisconnectReason::DuplicateHello => f.write_str("duplicate HELLO"),
            DisconnectReason::SlowConsumer => f.write_str("outbound queue over limit"),
            DisconnectReason::Shutdown => f.write_str("server shutting down"),
        }
    }
}

// ── Connection metadata ───────────────────────────────────────────────────────

/// Snapshot of one connection's identity and liveness.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    /// Set once the client has sent its `HELLO`.
    pub identified: bool,
    pub user_agent: Option<String>,
    /// Recorded from `HELLO`; reported but not used for routing.
    pub private_only: bool,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

impl ConnectionInfo {
    /// Display name: `<userAgent>:<id>` once identified.
    pub fn name(&self) -> String {
        match &self.user_agent {
            Some(ua) => format!("{ua}:{}", self.id),
            None => format!("unidentified:{}", self.id),
        }
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

// ── Outbound queue ────────────────────────────────────────────────────────────

/// Receiving half of a connection's outbound queue, owned by its write task.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Frame>,
    pending: Arc<AtomicUsize>,
}

impl OutboundQueue {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Marks `len` bytes as written, releasing them from the backpressure budget.
    pub fn complete(&self, len: usize) {
        self.pending.fetch_sub(len, Ordering::AcqRel);
    }
}

/// Everything a newly accepted connection's tasks need.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub outbound: OutboundQueue,
    /// Flips to `true` (or its sender drops) when the registry closes the
    /// connection.
    pub closed: watch::Receiver<bool>,
}

// ── Delivery report ───────────────────────────────────────────────────────────

/// Result of enqueueing one frame on many connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusDelivery {
    /// Connections the frame was offered to.
    pub attempted: usize,
    /// Connections whose queue accepted the frame.
    pub delivered: usize,
    /// Live connections at snapshot time, targeted or not.
    pub client_count: usize,
    pub failures: Vec<(ConnectionId, DeliveryError)>,
}

impl BusDelivery {
    /// Connections that refused the frame for exceeding their queue ceiling.
    pub fn slow_consumers(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.failures
            .iter()
            .filter(|(_, e)| matches!(e, DeliveryError::SlowConsumer { .. }))
            .map(|(id, _)| *id)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

struct Entry {
    info: ConnectionInfo,
    tx: mpsc::UnboundedSender<Frame>,
    pending: Arc<AtomicUsize>,
    close: watch::Sender<bool>,
}

impl Entry {
    fn try_enqueue(&self, frame: &Frame, limit: usize) -> Result<(), DeliveryError> {
        let id = self.info.id;
        let pending = self.pending.load(Ordering::Acquire);
        if pending.saturating_add(frame.len()) > limit {
            return Err(DeliveryError::SlowConsumer { id, pending, limit });
        }
        self.pending.fetch_add(frame.len(), Ordering::AcqRel);
        self.tx.send(Arc::clone(frame)).map_err(|_| {
            self.pending.fetch_sub(frame.len(), Ordering::AcqRel);
            DeliveryError::Closed(id)
        })
    }
}

#[derive(Default)]
struct Inner {
    next_id: ConnectionId,
    entries: BTreeMap<ConnectionId, Entry>,
}

/// Table of live connections, ordered by id (accept order).
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    max_pending_bytes: usize,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .field("max_pending_bytes", &self.max_pending_bytes)
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new(max_pending_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_pending_bytes,
        }
    }

    // A panic while holding the lock cannot leave the table half-updated:
    // every critical section is a single map operation or a read-only walk.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assigns the next id and adds an unidentified connection.
    pub fn register(&self, peer: SocketAddr) -> Registration {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close, closed) = watch::channel(false);
        let pending = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            id,
            Entry {
                info: ConnectionInfo {
                    id,
                    peer,
                    identified: false,
                    user_agent: None,
                    private_only: false,
                    connected_at: now,
                    last_activity: now,
                },
                tx,
                pending: Arc::clone(&pending),
                close,
            },
        );
        drop(inner);

        debug!(id, %peer, "connection registered");
        Registration {
            id,
            outbound: OutboundQueue { rx, pending },
            closed,
        }
    }

    /// Removes a connection and signals its tasks to stop.
    ///
    /// Idempotent: returns `None` when the id is already gone.
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let entry = self.lock().entries.remove(&id)?;
        entry.close.send_replace(true);
        Some(entry.info)
    }

    /// Removes every connection, returning them in id order.
    pub fn drain(&self) -> Vec<ConnectionInfo> {
        let entries = std::mem::take(&mut self.lock().entries);
        entries
            .into_values()
            .map(|entry| {
                entry.close.send_replace(true);
                entry.info
            })
            .collect()
    }

    /// Ids of every live connection, in accept order.
    pub fn snapshot(&self) -> Vec<ConnectionId> {
        self.lock().entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.lock().entries.get(&id).map(|e| e.info.clone())
    }

    /// Metadata of every live connection, in accept order.
    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.lock().entries.values().map(|e| e.info.clone()).collect()
    }

    pub fn identified_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.info.identified)
            .count()
    }

    /// Records the client's `HELLO`.  A connection can be identified once.
    pub fn identify(
        &self,
        id: ConnectionId,
        user_agent: &str,
        private_only: bool,
    ) -> Result<ConnectionInfo, IdentifyError> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(IdentifyError::NotFound(id))?;
        if entry.info.identified {
            return Err(IdentifyError::AlreadyIdentified(id));
        }
        entry.info.identified = true;
        entry.info.user_agent = Some(user_agent.to_string());
        entry.info.private_only = private_only;
        Ok(entry.info.clone())
    }

    /// Updates the last-activity timestamp.  `false` when the id is gone.
    pub fn touch(&self, id: ConnectionId) -> bool {
        match self.lock().entries.get_mut(&id) {
            Some(entry) => {
                entry.info.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Queues one frame on one connection.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::SlowConsumer`] leaves the connection registered; the
    /// caller decides whether to evict it.
    pub fn enqueue(&self, id: ConnectionId, frame: Frame) -> Result<(), DeliveryError> {
        let inner = self.lock();
        let entry = inner.entries.get(&id).ok_or(DeliveryError::NotFound(id))?;
        entry.try_enqueue(&frame, self.max_pending_bytes)
    }

    /// Queues one frame on every live connection accepted by `filter`.
    ///
    /// Enumeration and enqueueing happen under one lock acquisition.  A
    /// failure on one connection is recorded and the walk continues.
    pub fn enqueue_all<F>(&self, frame: Frame, filter: F) -> BusDelivery
    where
        F: Fn(&ConnectionInfo) -> bool,
    {
        let inner = self.lock();
        let mut delivery = BusDelivery {
            client_count: inner.entries.len(),
            ..BusDelivery::default()
        };
        for entry in inner.entries.values().filter(|e| filter(&e.info)) {
            delivery.attempted += 1;
            match entry.try_enqueue(&frame, self.max_pending_bytes) {
                Ok(()) => delivery.delivered += 1,
                Err(e) => delivery.failures.push((entry.info.id, e)),
            }
        }
        delivery
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
