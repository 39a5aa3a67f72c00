//! Session lifecycle state machine
//!
//! Shared by broker-side connections and the client session. Each side owns
//! a [`SessionTracker`]; its status is published through a `watch` channel
//! so that the receive loop, the holder waiting on a disconnect handshake
//! and the collector all observe the same flags without polling globals.
//!
//! ```text
//! Connecting -> Connected -> Disconnecting -> Closed
//! ```
//!
//! Any state may jump straight to `Closed` when the peer vanishes or a
//! handshake budget runs out.

mod error;
mod handshake;

pub use error::ConnectionError;
pub use handshake::expect_request;

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, CONN/CONN_ACK not yet exchanged
    Connecting,
    /// Handshake complete
    Connected,
    /// DISC sent, waiting for DISC_ACK
    Disconnecting,
    /// Session over, resources may be reclaimed
    Closed,
}

/// Snapshot of a session's lifecycle flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// CONN_ACK exchanged
    pub connected: bool,
    /// Peer acknowledged the disconnect handshake
    pub disconnected: bool,
    /// Resources may be reclaimed
    pub cleanup: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Connecting,
            connected: false,
            disconnected: false,
            cleanup: false,
        }
    }
}

/// Bounded polling budget for a handshake step
///
/// A step is retried at most `retries` times, each try waiting at most
/// `interval` for progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }

    /// Upper bound on the time a step may take
    pub fn budget(&self) -> Duration {
        self.interval * self.retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_millis(100))
    }
}

/// Owner of a session's lifecycle flags
#[derive(Debug)]
pub struct SessionTracker {
    tx: watch::Sender<SessionStatus>,
}

impl SessionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionStatus::default());
        Self { tx }
    }

    pub fn status(&self) -> SessionStatus {
        *self.tx.borrow()
    }

    pub fn state(&self) -> SessionState {
        self.tx.borrow().state
    }

    pub fn is_cleanup(&self) -> bool {
        self.tx.borrow().cleanup
    }

    /// Watch for status changes
    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    /// CONN/CONN_ACK completed
    pub fn mark_connected(&self) {
        self.tx.send_modify(|s| {
            if s.state == SessionState::Connecting {
                s.state = SessionState::Connected;
                s.connected = true;
            }
        });
    }

    /// Move a connected session to `Disconnecting`
    ///
    /// Returns true only for the caller that made the transition; that
    /// caller sends the DISC.
    pub fn begin_disconnect(&self) -> bool {
        self.tx.send_if_modified(|s| {
            if s.state != SessionState::Connected {
                return false;
            }
            s.state = SessionState::Disconnecting;
            true
        })
    }

    /// Disconnect handshake finished in either direction
    pub fn mark_disconnected(&self) {
        self.tx.send_modify(|s| {
            s.state = SessionState::Closed;
            s.disconnected = true;
            s.cleanup = true;
        });
    }

    /// Session abandoned without a completed handshake (peer vanished,
    /// handshake timed out, forced shutdown)
    pub fn mark_cleanup(&self) {
        self.tx.send_modify(|s| {
            s.state = SessionState::Closed;
            s.cleanup = true;
        });
    }

    /// Wait for the peer to acknowledge a disconnect within `policy`
    ///
    /// Returns whether the `disconnected` flag was observed. A session that
    /// reaches cleanup without it ends the wait early.
    pub async fn wait_disconnected(&self, policy: RetryPolicy) -> bool {
        let mut rx = self.watch();
        for _ in 0..policy.retries {
            let status = *rx.borrow_and_update();
            if status.disconnected {
                return true;
            }
            if status.cleanup {
                return false;
            }
            // A timeout is one spent try; a closed channel cannot happen
            // while `self` holds the sender.
            let _ = timeout(policy.interval, rx.changed()).await;
        }
        let status = *rx.borrow();
        status.disconnected
    }

    /// Resolve once `cleanup` is set
    pub async fn closed(&self) {
        let mut rx = self.watch();
        let _ = rx.wait_for(|s| s.cleanup).await;
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let tracker = SessionTracker::new();
        assert_eq!(tracker.state(), SessionState::Connecting);

        tracker.mark_connected();
        assert_eq!(tracker.state(), SessionState::Connected);
        assert!(tracker.status().connected);

        assert!(tracker.begin_disconnect());
        assert_eq!(tracker.state(), SessionState::Disconnecting);
        // Only one side sends the DISC
        assert!(!tracker.begin_disconnect());

        tracker.mark_disconnected();
        let status = tracker.status();
        assert_eq!(status.state, SessionState::Closed);
        assert!(status.disconnected);
        assert!(status.cleanup);

        // Closed is terminal
        assert!(!tracker.begin_disconnect());
        tracker.mark_connected();
        assert_eq!(tracker.state(), SessionState::Closed);
    }

    #[test]
    fn test_forced_cleanup_is_not_disconnected() {
        let tracker = SessionTracker::new();
        tracker.mark_connected();
        tracker.mark_cleanup();
        let status = tracker.status();
        assert!(status.cleanup);
        assert!(!status.disconnected);
    }

    #[tokio::test]
    async fn test_wait_disconnected_times_out() {
        let tracker = SessionTracker::new();
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let start = tokio::time::Instant::now();
        assert!(!tracker.wait_disconnected(policy).await);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_wait_disconnected_wakes_on_ack() {
        let tracker = std::sync::Arc::new(SessionTracker::new());
        let acker = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            acker.mark_disconnected();
        });

        let policy = RetryPolicy::new(50, Duration::from_millis(100));
        let start = tokio::time::Instant::now();
        assert!(tracker.wait_disconnected(policy).await);
        assert!(start.elapsed() < policy.budget());
    }

    #[tokio::test]
    async fn test_wait_disconnected_stops_on_cleanup() {
        let tracker = std::sync::Arc::new(SessionTracker::new());
        tracker.mark_connected();
        let closer = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.mark_cleanup();
        });

        let policy = RetryPolicy::new(10, Duration::from_millis(200));
        let start = tokio::time::Instant::now();
        assert!(!tracker.wait_disconnected(policy).await);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_closed_resolves_on_cleanup() {
        let tracker = std::sync::Arc::new(SessionTracker::new());
        let closer = tracker.clone();
        let waiter = tokio::spawn(async move { tracker.closed().await });
        closer.mark_cleanup();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
