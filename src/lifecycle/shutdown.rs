//! Cancellation scope shared between the supervisor, workloads and `stop`.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ContextError;

/// A cooperative stop request with an optional deadline.
///
/// Cloning yields a handle to the same scope. [`StopToken::child`] derives a
/// scope that is cancelled together with its parent but can also be cancelled
/// on its own.
#[derive(Debug, Clone)]
pub struct StopToken {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl StopToken {
    /// Create a scope that only ends when cancelled.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Create a scope that also ends once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().child_with_timeout(timeout)
    }

    /// Derive a child scope. Cancelling the child leaves the parent untouched.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child scope whose deadline is the earlier of the parent's and
    /// `now + timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let ours = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(ours, |parent| parent.min(ours))),
        }
    }

    /// Request a stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the scope ended, or `None` while it is still live.
    ///
    /// An explicit cancel takes precedence over an elapsed deadline.
    pub fn error(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.error().is_some()
    }

    /// Resolves once the scope is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => ContextError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}
