//! Live connection registry
//!
//! The registry holds the authoritative reference to every admitted
//! connection. Topic subscriber lists only hold [`ConnectionId`]s and look
//! the handle up here at delivery time.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::{Frame, Request};
use crate::session::{RetryPolicy, SessionTracker};

/// Stable per-connection identifier
pub type ConnectionId = u64;

/// Outcome of queueing a frame for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued,
    /// Outbound channel full, frame dropped
    Dropped,
    /// Connection task is gone
    Closed,
}

/// Broker-side view of one admitted connection
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    addr: SocketAddr,
    outbound: mpsc::Sender<Frame>,
    session: SessionTracker,
    /// Subscribed node names in subscription order.
    /// Only touched while the router lock is held.
    pub(crate) topics: Mutex<Vec<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue
    pub fn new(
        id: ConnectionId,
        addr: SocketAddr,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let handle = Arc::new(Self {
            id,
            addr,
            outbound,
            session: SessionTracker::new(),
            topics: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        });
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn session(&self) -> &SessionTracker {
        &self.session
    }

    /// Snapshot of the subscribed node names
    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().clone()
    }

    /// Queue a frame without waiting
    pub fn deliver(&self, frame: Frame) -> QueueOutcome {
        match self.outbound.try_send(frame) {
            Ok(()) => QueueOutcome::Queued,
            Err(TrySendError::Full(_)) => QueueOutcome::Dropped,
            Err(TrySendError::Closed(_)) => QueueOutcome::Closed,
        }
    }

    /// Spawn the connection task and keep its handle for the collector
    ///
    /// The slot stays locked while spawning so a task that finishes at once
    /// is still joined.
    pub(crate) fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.task.lock();
        *slot = Some(tokio::spawn(task));
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }

    /// Graceful close initiated by the broker
    ///
    /// Sends DISC unless the connection task already did, then waits for
    /// the task to observe DISC_ACK. When the budget runs out the session
    /// is marked for cleanup anyway. Returns whether the peer acknowledged.
    pub async fn disconnect(&self, policy: RetryPolicy) -> bool {
        if self.session.is_cleanup() {
            return false;
        }
        if self.session.begin_disconnect() {
            debug!("Disconnecting connection {} ({})", self.id, self.addr);
            if self.deliver(Frame::control(Request::Disc)) != QueueOutcome::Queued {
                self.session.mark_cleanup();
                return false;
            }
        }

        let acked = self.session.wait_disconnected(policy).await;
        if !acked {
            debug!("Connection {} did not send DISC_ACK", self.id);
            self.session.mark_cleanup();
        }
        acked
    }
}

/// Registry of live connections
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    /// Allocate an identifier for a new connection
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    pub fn insert(&self, handle: Arc<ConnectionHandle>) {
        self.connections.insert(handle.id(), handle);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    /// Ids of connections whose session is marked for cleanup
    pub fn cleanup_ready(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| entry.value().session().is_cleanup())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Snapshot of every registered handle
    pub fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_capacity_and_cleanup_scan() {
        let registry = ConnectionRegistry::new(2);
        let (a, _rx_a) = ConnectionHandle::new(registry.next_id(), addr(), 4);
        let (b, _rx_b) = ConnectionHandle::new(registry.next_id(), addr(), 4);
        assert_ne!(a.id(), b.id());

        registry.insert(a.clone());
        assert!(!registry.is_full());
        registry.insert(b.clone());
        assert!(registry.is_full());

        b.session().mark_cleanup();
        assert_eq!(registry.cleanup_ready(), vec![b.id()]);

        assert!(registry.remove(b.id()).is_some());
        assert!(registry.remove(b.id()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deliver_reports_full_and_closed() {
        let (handle, rx) = ConnectionHandle::new(1, addr(), 1);
        assert_eq!(handle.deliver(Frame::control(Request::List)), QueueOutcome::Queued);
        assert_eq!(handle.deliver(Frame::control(Request::List)), QueueOutcome::Dropped);
        drop(rx);
        assert_eq!(handle.deliver(Frame::control(Request::List)), QueueOutcome::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_acknowledged() {
        let (handle, mut rx) = ConnectionHandle::new(1, addr(), 4);
        handle.session().mark_connected();

        let peer = handle.clone();
        tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.request, Request::Disc);
            peer.session().mark_disconnected();
        });

        let policy = RetryPolicy::new(10, Duration::from_millis(50));
        assert!(handle.disconnect(policy).await);
        assert!(handle.session().status().disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_timeout_forces_cleanup() {
        let (handle, _rx) = ConnectionHandle::new(1, addr(), 4);
        handle.session().mark_connected();

        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        assert!(!handle.disconnect(policy).await);
        let status = handle.session().status();
        assert!(status.cleanup);
        assert!(!status.disconnected);
    }
}
