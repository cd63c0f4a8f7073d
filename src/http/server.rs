//! HTTP server lifecycle.
//!
//! # Responsibilities
//! - Run one accept loop per listener, all sharing one handler and one
//!   connection builder
//! - Wait for every accept loop to report before `start` returns
//! - Close listeners, drain connections and bound the drain in `stop`
//!
//! # Design Decisions
//! - `start` and `stop` are separate halves so `stop` can live in a signal
//!   handler while `start` runs as the supervised workload
//! - A listener closed by `stop` reports success; only abnormal accept loop
//!   exits are errors, and all of them are joined
//! - `start` is held until `stop` has finished draining, so a supervisor
//!   running `start` as its workload cannot finish ahead of the shutdown
//! - A failed build still yields both halves: `start` fails with the
//!   configuration error, `stop` does nothing

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{ConfigError, Error, ListenerError, ShutdownError};
use crate::http::builder::{ServerConfig, Step};
use crate::lifecycle::{Exit, StopToken};
use crate::net::connection::{ConnectionId, Connections};
use crate::net::listener::{Accepted, BoundListener, Listener, ListenerBinding};
use crate::net::tls::TlsMaterial;

/// Upper bound on a TLS handshake before the connection is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_BACKOFF_BASE_MS: u64 = 5;
const ACCEPT_BACKOFF_MAX_MS: u64 = 1000;

/// State shared by the two halves and every task they spawn.
struct Shared {
    service: Router,
    tls: Option<TlsMaterial>,
    http: auto::Builder<TokioExecutor>,
    connections: Connections,
    close: CancellationToken,
    bindings: Vec<ListenerBinding>,
    grace: Option<Duration>,
    stopped: AtomicBool,
    /// Cancelled once `stop` has returned (or was abandoned).
    finished: CancellationToken,
}

/// HTTP server over one or more listeners.
pub struct HttpServer {
    start: ServerStart,
    stop: ServerStop,
}

impl HttpServer {
    /// Create a server from a validated configuration.
    pub fn new(config: ServerConfig) -> Self {
        let shared = Arc::new(Shared {
            service: config.service(),
            tls: config.tls().cloned(),
            http: auto::Builder::new(TokioExecutor::new()),
            connections: Connections::new(),
            close: CancellationToken::new(),
            bindings: config.bindings(),
            grace: config.grace(),
            stopped: AtomicBool::new(false),
            finished: CancellationToken::new(),
        });

        Self {
            start: ServerStart {
                state: StartState::Ready {
                    listeners: config.into_listeners(),
                    shared: shared.clone(),
                },
            },
            stop: ServerStop { shared: Some(shared) },
        }
    }

    /// Apply `steps` and create the server, or report the first failure.
    pub fn try_build(steps: impl IntoIterator<Item = Step>) -> Result<Self, ConfigError> {
        ServerConfig::from_steps(steps).map(Self::new)
    }

    /// Apply `steps` and split the server into its halves.
    ///
    /// Never fails: an invalid configuration produces a `start` that returns
    /// the configuration error and a `stop` that does nothing.
    pub fn build(steps: impl IntoIterator<Item = Step>) -> (ServerStart, ServerStop) {
        match Self::try_build(steps) {
            Ok(server) => server.into_parts(),
            Err(err) => (
                ServerStart {
                    state: StartState::Failed(err),
                },
                ServerStop { shared: None },
            ),
        }
    }

    pub fn bindings(&self) -> &[ListenerBinding] {
        self.stop.bindings()
    }

    pub fn into_parts(self) -> (ServerStart, ServerStop) {
        (self.start, self.stop)
    }
}

enum StartState {
    Ready {
        listeners: Vec<BoundListener>,
        shared: Arc<Shared>,
    },
    Failed(ConfigError),
}

/// The half that runs the accept loops.
pub struct ServerStart {
    state: StartState,
}

impl ServerStart {
    pub fn bindings(&self) -> &[ListenerBinding] {
        match &self.state {
            StartState::Ready { shared, .. } => shared.bindings.as_slice(),
            StartState::Failed(_) => &[],
        }
    }

    /// Serve on every listener until all of them have stopped.
    ///
    /// Returns `Ok` once every listener was closed by [`ServerStop::stop`]
    /// and that stop has finished; otherwise every abnormal exit is
    /// reported, joined.
    pub async fn start(self) -> Result<(), Error> {
        let (bound, shared) = match self.state {
            StartState::Ready { listeners, shared } => (listeners, shared),
            StartState::Failed(err) => return Err(err.into()),
        };
        if bound.is_empty() {
            return Err(ConfigError::NoListeners.into());
        }

        // Register everything before spawning anything: no partial startup.
        let mut listeners = Vec::with_capacity(bound.len());
        for bound in bound {
            let name = bound.binding().to_string();
            match bound.into_listener() {
                Ok(listener) => listeners.push(listener),
                Err(source) => return Err(ListenerError::Register { listener: name, source }.into()),
            }
        }

        let expected = listeners.len();
        let (tx, mut rx) = mpsc::channel(expected);
        for listener in listeners {
            let tx = tx.clone();
            let shared_for_task = shared.clone();
            shared.connections.spawn(async move {
                let report = accept_loop(listener, shared_for_task).await;
                let _ = tx.send(report).await;
            });
        }
        drop(tx);

        tracing::info!(listeners = expected, tls = shared.tls.is_some(), "HTTP server started");

        let mut errors: Vec<Error> = Vec::new();
        let mut received = 0;
        while let Some(report) = rx.recv().await {
            received += 1;
            if let Err(err) = report {
                errors.push(err.into());
            }
        }
        if received < expected {
            errors.push(
                ListenerError::Lost {
                    listener: format!("{} of {} listener(s)", expected - received, expected),
                }
                .into(),
            );
        }

        if errors.is_empty() && shared.close.is_cancelled() {
            tracing::debug!("Listeners closed, waiting for shutdown to finish");
            shared.finished.cancelled().await;
        }

        tracing::info!(failed = errors.len(), "HTTP server stopped");
        Error::join(errors)
    }
}

impl std::fmt::Debug for ServerStart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            StartState::Ready { shared, .. } => f.debug_struct("ServerStart").field("bindings", &shared.bindings).finish(),
            StartState::Failed(err) => f.debug_struct("ServerStart").field("error", err).finish(),
        }
    }
}

/// The half that shuts the server down. Cheap to clone.
#[derive(Clone)]
pub struct ServerStop {
    shared: Option<Arc<Shared>>,
}

impl ServerStop {
    pub fn bindings(&self) -> &[ListenerBinding] {
        match self.shared.as_deref() {
            Some(shared) => shared.bindings.as_slice(),
            None => &[],
        }
    }

    /// Close all listeners and drain connections, bounded by `token`.
    ///
    /// Listener close failures, an unfinished drain and the token's own
    /// cancellation are all reported, joined. Calling it again is a no-op.
    ///
    /// A running [`ServerStart::start`] returns only after this does.
    pub async fn stop(&self, token: &StopToken) -> Result<(), Error> {
        let Some((shared, _release)) = self.begin() else {
            return Ok(());
        };
        shutdown(shared, token).await
    }

    /// Stop like [`stop`](Self::stop) and report the outcome through `exit`
    /// before `start` is released.
    ///
    /// Under a [`Supervisor`](crate::lifecycle::Supervisor) whose workload is
    /// `start`, this makes the shutdown outcome the one `exec` returns.
    pub async fn stop_and_exit(&self, token: &StopToken, exit: Exit<Error>) {
        let Some((shared, _release)) = self.begin() else {
            exit.done();
            return;
        };
        exit.send(shutdown(shared, token).await);
    }

    /// Claim the shutdown. The guard releases `start` when dropped.
    fn begin(&self) -> Option<(&Shared, DropGuard)> {
        let shared = self.shared.as_deref()?;
        if shared.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("HTTP server already stopped");
            return None;
        }
        Some((shared, shared.finished.clone().drop_guard()))
    }

    /// Swap in a new certificate pair for subsequent handshakes.
    pub fn reload_tls(&self, cert: &Path, key: &Path) -> Result<(), Error> {
        match self.shared.as_deref().and_then(|shared| shared.tls.as_ref()) {
            Some(tls) => Ok(tls.reload(cert, key)?),
            None => Err(ConfigError::Tls("TLS is not enabled on this server".into()).into()),
        }
    }
}

impl std::fmt::Debug for ServerStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStop").field("bindings", &self.bindings()).finish()
    }
}

/// Close listeners, wait out the grace delay, drain within `token`.
async fn shutdown(shared: &Shared, token: &StopToken) -> Result<(), Error> {
    tracing::info!(listeners = shared.bindings.len(), "HTTP server stopping");
    let mut errors: Vec<Error> = Vec::new();

    shared.close.cancel();
    for binding in &shared.bindings {
        if let Err(source) = binding.release() {
            tracing::warn!(listener = %binding, error = %source, "Failed to close listener");
            errors.push(
                ShutdownError::Close {
                    listener: binding.to_string(),
                    source,
                }
                .into(),
            );
        }
    }

    if let Some(grace) = shared.grace {
        tracing::debug!(grace_ms = grace.as_millis() as u64, "Waiting before drain");
        tokio::select! {
            _ = tokio::time::sleep(grace) => {}
            _ = token.done() => {}
        }
    }

    shared.connections.drain();
    tokio::select! {
        biased;
        _ = shared.connections.wait() => {
            tracing::info!("All connections drained");
        }
        _ = token.done() => {
            let open = shared.connections.open();
            tracing::warn!(open, "Drain interrupted, forcing connections closed");
            shared.connections.force();
            errors.push(ShutdownError::Incomplete { open }.into());
        }
    }

    if let Some(err) = token.error() {
        errors.push(err.into());
    }
    Error::join(errors)
}

/// Accept until the listener is closed or fails for good.
async fn accept_loop(listener: Listener, shared: Arc<Shared>) -> Result<(), ListenerError> {
    let name = listener.binding().to_string();
    tracing::info!(listener = %name, "Accepting connections");

    let mut attempt = 0u32;
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shared.close.cancelled() => {
                tracing::info!(listener = %name, "Listener closed");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(conn) => {
                attempt = 0;
                serve(&shared, conn);
            }
            Err(err) if is_transient(&err) => {
                attempt = attempt.saturating_add(1);
                let delay = accept_backoff(attempt);
                tracing::warn!(listener = %name, error = %err, retry_ms = delay.as_millis() as u64, "Accept failed, retrying");
                tokio::select! {
                    _ = shared.close.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(source) => {
                tracing::error!(listener = %name, error = %source, "Accept failed");
                return Err(ListenerError::Accept { listener: name, source });
            }
        }
    }
}

/// Errors that say nothing about the listener itself.
fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    // ENOMEM, ENFILE, EMFILE, ENOBUFS (Linux values).
    const RESOURCE_EXHAUSTED: [i32; 4] = [12, 23, 24, 105];

    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    ) || err.raw_os_error().is_some_and(|code| RESOURCE_EXHAUSTED.contains(&code))
}

/// Exponential accept backoff: 5ms doubling up to 1s.
fn accept_backoff(attempt: u32) -> Duration {
    let exponential = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(ACCEPT_BACKOFF_BASE_MS.saturating_mul(exponential).min(ACCEPT_BACKOFF_MAX_MS))
}

fn serve(shared: &Arc<Shared>, conn: Accepted) {
    let shared_for_task = shared.clone();
    let id = ConnectionId::new();
    shared.connections.spawn(async move {
        match conn {
            Accepted::Tcp(stream, peer) => {
                tracing::debug!(connection_id = %id, peer_addr = %peer, "Connection accepted");
                shared_for_task.handshake_and_serve(stream, id).await;
            }
            Accepted::Unix(stream) => {
                tracing::debug!(connection_id = %id, "Connection accepted");
                shared_for_task.handshake_and_serve(stream, id).await;
            }
        }
        tracing::trace!(connection_id = %id, "Connection closed");
    });
}

impl Shared {
    async fn handshake_and_serve<S>(&self, stream: S, id: ConnectionId)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(tls) = &self.tls else {
            return self.serve_http(stream, id).await;
        };

        let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, tls.acceptor().accept(stream));
        let stream = tokio::select! {
            _ = self.connections.draining().cancelled() => return,
            result = handshake => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    tracing::debug!(connection_id = %id, error = %err, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(connection_id = %id, "TLS handshake timed out");
                    return;
                }
            },
        };
        self.serve_http(stream, id).await
    }

    async fn serve_http<S>(&self, stream: S, id: ConnectionId)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = TowerToHyperService::new(self.service.clone());
        let conn = self
            .http
            .serve_connection_with_upgrades(TokioIo::new(stream), service);
        tokio::pin!(conn);

        let mut draining = false;
        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(err) = result {
                        tracing::debug!(connection_id = %id, error = %err, "Connection error");
                    }
                    return;
                }
                _ = self.connections.draining().cancelled(), if !draining => {
                    draining = true;
                    conn.as_mut().graceful_shutdown();
                }
                _ = self.connections.forced().cancelled() => {
                    tracing::debug!(connection_id = %id, "Connection force-closed");
                    return;
                }
            }
        }
    }
}
