//! OS signal handling.
//!
//! # Responsibilities
//! - Map each observed signal to exactly one caller-defined handler
//! - Subscribe to the signals present in the map, and nothing else
//! - Run every handler invocation as its own task
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - No fixed meaning per signal: reload, maintenance, graceful or forced
//!   stop are all up to the handler
//! - Handlers report termination through an [`Exit`] sink that never blocks

use std::collections::HashMap;
use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::sync::Arc;
use std::task::Poll;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The signals a [`SignalHandlers`] map may observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Signal {
    /// SIGHUP
    Hangup,
    /// SIGUSR1
    User1,
    /// SIGUSR2
    User2,
    /// SIGTERM
    Terminate,
    /// SIGINT
    Interrupt,
    /// SIGQUIT
    Quit,
}

impl Signal {
    pub const ALL: [Signal; 6] = [
        Signal::Hangup,
        Signal::User1,
        Signal::User2,
        Signal::Terminate,
        Signal::Interrupt,
        Signal::Quit,
    ];

    fn kind(self) -> SignalKind {
        match self {
            Signal::Hangup => SignalKind::hangup(),
            Signal::User1 => SignalKind::user_defined1(),
            Signal::User2 => SignalKind::user_defined2(),
            Signal::Terminate => SignalKind::terminate(),
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Quit => SignalKind::quit(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Hangup => "SIGHUP",
            Signal::User1 => "SIGUSR1",
            Signal::User2 => "SIGUSR2",
            Signal::Terminate => "SIGTERM",
            Signal::Interrupt => "SIGINT",
            Signal::Quit => "SIGQUIT",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Write-once sink for a terminal outcome.
///
/// Handlers and the workload share one completion channel. Sending never
/// waits: if an outcome was already decided the value is discarded.
pub struct Exit<E> {
    tx: mpsc::Sender<Result<(), E>>,
}

impl<E> Exit<E> {
    pub(crate) fn new(tx: mpsc::Sender<Result<(), E>>) -> Self {
        Self { tx }
    }

    /// Terminate cleanly.
    pub fn done(self) -> bool {
        self.send(Ok(()))
    }

    /// Terminate with `err`.
    pub fn fail(self, err: E) -> bool {
        self.send(Err(err))
    }

    /// Offer `outcome`. Returns `false` when another source already won.
    pub fn send(self, outcome: Result<(), E>) -> bool {
        self.tx.try_send(outcome).is_ok()
    }
}

impl<E> fmt::Debug for Exit<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exit").field("closed", &self.tx.is_closed()).finish()
    }
}

type HandlerFn<E> = Arc<dyn Fn(Exit<E>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Mapping from signal to the callback run on each delivery.
pub struct SignalHandlers<E> {
    handlers: HashMap<Signal, HandlerFn<E>>,
}

impl<E: Send + 'static> SignalHandlers<E> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `signal`, replacing any earlier registration.
    ///
    /// The handler may take as long as it likes; it runs on its own task.
    /// Dropping the [`Exit`] without sending leaves the supervisor running.
    pub fn on<F, Fut>(mut self, signal: Signal, handler: F) -> Self
    where
        F: Fn(Exit<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: HandlerFn<E> = Arc::new(move |exit: Exit<E>| handler(exit).boxed());
        self.handlers.insert(signal, handler);
        self
    }

    /// Registered signals, in a stable order.
    pub fn signals(&self) -> Vec<Signal> {
        let mut signals: Vec<Signal> = self.handlers.keys().copied().collect();
        signals.sort();
        signals
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<E: Send + 'static> Default for SignalHandlers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for SignalHandlers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Live OS subscriptions, one per registered signal.
///
/// Dropping this value stops delivery to our handlers only: the runtime's
/// process-wide signal handler stays installed, so later deliveries are
/// swallowed instead of taking their default action.
pub(crate) struct Subscriptions {
    streams: Vec<(Signal, tokio::signal::unix::Signal)>,
}

impl Subscriptions {
    pub(crate) fn subscribe(signals: &[Signal]) -> io::Result<Self> {
        let streams = signals
            .iter()
            .map(|&sig| signal(sig.kind()).map(|stream| (sig, stream)))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self { streams })
    }

    /// Wait for the next delivery. Never resolves when nothing is subscribed.
    async fn next(&mut self) -> Signal {
        poll_fn(|cx| {
            for (sig, stream) in self.streams.iter_mut() {
                if let Poll::Ready(Some(())) = stream.poll_recv(cx) {
                    return Poll::Ready(*sig);
                }
            }
            Poll::Pending
        })
        .await
    }
}

/// Routes deliveries to handlers until told to stop.
pub(crate) struct Dispatcher<E> {
    handlers: SignalHandlers<E>,
    subscriptions: Subscriptions,
    exit: mpsc::Sender<Result<(), E>>,
}

impl<E: Send + 'static> Dispatcher<E> {
    pub(crate) fn new(
        handlers: SignalHandlers<E>,
        subscriptions: Subscriptions,
        exit: mpsc::Sender<Result<(), E>>,
    ) -> Self {
        Self {
            handlers,
            subscriptions,
            exit,
        }
    }

    /// Spawn the handler registered for `sig`, if any.
    pub(crate) fn dispatch(&self, sig: Signal) -> bool {
        let Some(handler) = self.handlers.handlers.get(&sig) else {
            tracing::debug!(signal = %sig, "No handler registered, ignoring");
            return false;
        };
        tracing::debug!(signal = %sig, "Dispatching signal handler");
        tokio::spawn(handler(Exit::new(self.exit.clone())));
        true
    }

    /// Dispatch loop. Returns when `stop` is cancelled, dropping the
    /// subscriptions on the way out.
    pub(crate) async fn run(mut self, stop: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                sig = self.subscriptions.next() => {
                    tracing::info!(signal = %sig, "Signal received");
                    self.dispatch(sig);
                }
            }
        }
        tracing::debug!("Signal dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn later_registration_replaces_earlier() {
        let handlers = SignalHandlers::<()>::new()
            .on(Signal::Hangup, |_| async {})
            .on(Signal::Terminate, |_| async {})
            .on(Signal::Hangup, |exit| async move {
                exit.done();
            });

        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers.signals(), vec![Signal::Hangup, Signal::Terminate]);
    }

    #[test]
    fn exit_accepts_only_the_first_outcome() {
        let (tx, mut rx) = mpsc::channel::<Result<(), &str>>(1);
        assert!(Exit::new(tx.clone()).fail("first"));
        assert!(!Exit::new(tx.clone()).done());

        assert_eq!(rx.try_recv(), Ok(Err("first")));
        drop(rx);
        assert!(!Exit::new(tx).done());
    }

    #[tokio::test]
    async fn unregistered_signal_is_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handlers = SignalHandlers::<()>::new().on(Signal::User1, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let (tx, _rx) = mpsc::channel(1);
        let dispatcher = Dispatcher::new(handlers, Subscriptions { streams: Vec::new() }, tx);

        assert!(!dispatcher.dispatch(Signal::User2));
        assert!(dispatcher.dispatch(Signal::User1));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_subscription_never_fires() {
        let mut subscriptions = Subscriptions::subscribe(&[]).unwrap();
        let next = tokio::time::timeout(std::time::Duration::from_millis(20), subscriptions.next()).await;
        assert!(next.is_err());
    }
}
