//! Supervisor: one blocking call racing a workload against signal handlers.
//!
//! # Termination protocol
//! ```text
//! exec(parent, workload)
//!     ├─► spawn dispatch loop   (signal → spawn handler(Exit))
//!     ├─► spawn workload task   (workload(child scope) → Exit)
//!     ├─► first outcome on the completion channel wins
//!     ├─► cancel the workload's scope, stop the dispatch loop
//!     └─► wait for the loop to drop its subscriptions, return outcome
//! ```
//!
//! # Design Decisions
//! - Neither source has priority; arrival order alone decides
//! - Writers never block: a late outcome is discarded, not queued
//! - A workload that ignores cancellation is left to finish on its own

use std::future::Future;
use std::io;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::shutdown::StopToken;
use crate::lifecycle::signals::{Dispatcher, Exit, Signal, SignalHandlers, Subscriptions};

/// Runs a primary workload under an OS signal monitor.
///
/// Created once per [`exec`](Supervisor::exec) call. The signal subscription
/// is taken in [`register`](Supervisor::register) and dropped when `exec`
/// returns, whichever side ended it; no handler runs after that.
///
/// The OS disposition is not restored. Tokio keeps its process-wide handler
/// installed once a signal has been subscribed, so after `exec` returns a
/// delivery of a registered signal (SIGTERM, SIGINT, ...) is absorbed rather
/// than terminating the process. Callers that want the default action back
/// have to exit or re-raise it themselves.
pub struct Supervisor<E> {
    dispatcher: Dispatcher<E>,
    signals: Vec<Signal>,
    tx: mpsc::Sender<Result<(), E>>,
    rx: mpsc::Receiver<Result<(), E>>,
}

impl<E: Send + 'static> Supervisor<E> {
    /// Subscribe to exactly the signals present in `handlers`.
    pub fn register(handlers: SignalHandlers<E>) -> io::Result<Self> {
        let signals = handlers.signals();
        let subscriptions = Subscriptions::subscribe(&signals)?;
        // One slot: the first outcome is the only one ever read.
        let (tx, rx) = mpsc::channel(1);

        tracing::debug!(signals = ?signals, "Signal handlers registered");

        Ok(Self {
            dispatcher: Dispatcher::new(handlers, subscriptions, tx.clone()),
            signals,
            tx,
            rx,
        })
    }

    /// Signals this supervisor is subscribed to.
    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    /// Run `workload` until it returns or a handler reports an outcome.
    ///
    /// The workload receives a child of `parent` that is cancelled as soon as
    /// `exec` has its result. Panics in the workload are re-raised here.
    pub async fn exec<F, Fut>(self, parent: &StopToken, workload: F) -> Result<(), E>
    where
        F: FnOnce(StopToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let Self {
            dispatcher, tx, mut rx, ..
        } = self;

        let scope = parent.child();
        let dispatch_stop = CancellationToken::new();
        let dispatch = tokio::spawn(dispatcher.run(dispatch_stop.clone()));

        let task = workload(scope.clone());
        let mut runner = tokio::spawn(async move {
            let outcome = task.await;
            if !Exit::new(tx).send(outcome) {
                tracing::debug!("Workload finished after termination was decided");
            }
        });
        let mut runner_done = false;

        let outcome = loop {
            tokio::select! {
                outcome = rx.recv() => break outcome,
                joined = &mut runner, if !runner_done => {
                    runner_done = true;
                    if let Err(err) = joined {
                        if err.is_panic() {
                            scope.cancel();
                            dispatch_stop.cancel();
                            std::panic::resume_unwind(err.into_panic());
                        }
                    }
                }
            }
        };

        scope.cancel();
        dispatch_stop.cancel();
        if let Err(err) = dispatch.await {
            tracing::error!(error = %err, "Signal dispatch loop ended abnormally");
        }

        // The dispatch loop holds a sender until it is joined above, so the
        // channel cannot close before an outcome arrives.
        let outcome = outcome.unwrap_or(Ok(()));
        tracing::info!(clean = outcome.is_ok(), "Supervisor terminated");
        outcome
    }
}

impl<E> std::fmt::Debug for Supervisor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("signals", &self.signals)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn workload_result_is_returned() {
        let supervisor = Supervisor::register(SignalHandlers::new()).unwrap();
        assert!(supervisor.signals().is_empty());

        let result = supervisor
            .exec(&StopToken::new(), |_| async { Err::<(), _>("boom") })
            .await;
        assert_eq!(result, Err("boom"));
    }

    #[tokio::test]
    async fn workload_scope_is_cancelled_on_return() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let supervisor = Supervisor::<()>::register(SignalHandlers::new()).unwrap();

        let result = supervisor
            .exec(&StopToken::new(), move |scope| async move {
                let watcher = scope.clone();
                tokio::spawn(async move {
                    let _ = seen_tx.send(watcher.done().await);
                });
                Ok(())
            })
            .await;

        assert_eq!(result, Ok(()));
        let reason = tokio::time::timeout(Duration::from_secs(1), seen_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, crate::error::ContextError::Cancelled);
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_the_workload() {
        let parent = StopToken::new();
        let supervisor = Supervisor::<&str>::register(SignalHandlers::new()).unwrap();

        let canceller = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = supervisor
            .exec(&parent, |scope| async move {
                scope.done().await;
                Err("stopped")
            })
            .await;
        assert_eq!(result, Err("stopped"));
    }

    #[tokio::test]
    #[should_panic(expected = "workload exploded")]
    async fn workload_panic_is_propagated() {
        let supervisor = Supervisor::<()>::register(SignalHandlers::new()).unwrap();
        let _ = supervisor
            .exec(&StopToken::new(), |_| async {
                if true {
                    panic!("workload exploded");
                }
                Ok(())
            })
            .await;
    }
}
