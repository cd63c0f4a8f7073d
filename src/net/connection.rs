//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track every spawned accept loop and connection task
//! - Coordinate graceful shutdown per-connection
//!
//! # States
//! ```text
//! Active ──drain()──► Draining ──finishes──► Closed
//!                         └────force()─────► Closed
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Tracks the server's tasks for graceful shutdown.
///
/// `drain` asks connections to finish their in-flight requests, `force`
/// makes them drop immediately.
#[derive(Debug, Clone, Default)]
pub struct Connections {
    tracker: TaskTracker,
    drain: CancellationToken,
    force: CancellationToken,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` as part of the server.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Number of tracked tasks still running.
    pub fn open(&self) -> usize {
        self.tracker.len()
    }

    pub fn drain(&self) {
        self.drain.cancel();
    }

    pub fn force(&self) {
        self.force.cancel();
    }

    pub fn draining(&self) -> &CancellationToken {
        &self.drain
    }

    pub fn forced(&self) -> &CancellationToken {
        &self.force
    }

    /// Wait until every tracked task has finished. New tasks may still be
    /// spawned while waiting; they are waited for too.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert_eq!(format!("{}", id1), format!("conn-{}", id1.as_u64()));
    }

    #[tokio::test]
    async fn wait_returns_once_drained_tasks_finish() {
        let connections = Connections::new();
        for _ in 0..3 {
            let drain = connections.draining().clone();
            connections.spawn(async move { drain.cancelled().await });
        }
        assert_eq!(connections.open(), 3);

        let waiting = tokio::time::timeout(Duration::from_millis(20), connections.wait()).await;
        assert!(waiting.is_err());

        connections.drain();
        tokio::time::timeout(Duration::from_secs(1), connections.wait())
            .await
            .unwrap();
        assert_eq!(connections.open(), 0);
    }
}
