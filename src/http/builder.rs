//! Server configuration steps.
//!
//! # Responsibilities
//! - Apply an ordered list of fallible [`Step`]s to one [`ServerConfig`]
//! - Stop at the first failing step and release what was already bound
//! - Check the finished configuration (handler present, listeners present)
//!
//! # Design Decisions
//! - Order matters: a TCP step without a port uses `:443` only if TLS was
//!   enabled by an earlier step
//! - TLS material is validated and parsed by the step itself, so a bad pair
//!   fails here rather than on the first connection
//! - The finished config is immutable; the server only reads it

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::error::ConfigError;
use crate::net::activation::ActivationEnv;
use crate::net::listener::{self, BoundListener, ListenerBinding};
use crate::net::tls::TlsMaterial;

/// One unit of server configuration.
pub enum Step {
    /// Listen on a TCP address. Empty means all interfaces, default port.
    Tcp(String),
    /// Listen on a Unix domain socket path.
    Unix(PathBuf),
    /// Serve every listener over TLS with this certificate/key pair.
    Tls { cert: PathBuf, key: PathBuf },
    /// Adopt listeners passed by a service manager.
    SocketActivation(ActivationEnv),
    /// Request handler shared by all listeners.
    Handler(Router),
    /// Upper bound on producing a response.
    WriteTimeout(Duration),
    /// Pause between closing listeners and draining connections.
    Grace(Duration),
}

impl Step {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Step::Tcp(addr.into())
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Step::Unix(path.into())
    }

    pub fn tls(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Step::Tls {
            cert: cert.into(),
            key: key.into(),
        }
    }

    /// Socket activation using the process environment.
    pub fn socket_activation() -> Self {
        Step::SocketActivation(ActivationEnv::from_process())
    }

    pub fn handler(router: Router) -> Self {
        Step::Handler(router)
    }

    pub fn write_timeout(timeout: Duration) -> Self {
        Step::WriteTimeout(timeout)
    }

    pub fn grace(delay: Duration) -> Self {
        Step::Grace(delay)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Step::Tcp(_) => "tcp",
            Step::Unix(_) => "unix",
            Step::Tls { .. } => "tls",
            Step::SocketActivation(_) => "socket_activation",
            Step::Handler(_) => "handler",
            Step::WriteTimeout(_) => "write_timeout",
            Step::Grace(_) => "grace",
        }
    }

    fn apply(self, config: &mut ServerConfig) -> Result<(), ConfigError> {
        match self {
            Step::Tcp(addr) => {
                let bound = listener::bind_tcp(&addr, config.tls.is_some())?;
                config.listeners.push(bound);
            }
            Step::Unix(path) => {
                config.listeners.push(listener::bind_unix(&path)?);
            }
            Step::Tls { cert, key } => {
                config.tls = Some(TlsMaterial::load(&cert, &key)?);
                config.tls_paths = Some((cert, key));
            }
            Step::SocketActivation(env) => {
                config.listeners.extend(env.listeners()?);
            }
            Step::Handler(router) => config.handler = Some(router),
            Step::WriteTimeout(timeout) => config.write_timeout = Some(timeout),
            Step::Grace(delay) => config.grace = Some(delay),
        }
        Ok(())
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Tcp(addr) => f.debug_tuple("Tcp").field(addr).finish(),
            Step::Unix(path) => f.debug_tuple("Unix").field(path).finish(),
            Step::Tls { cert, key } => f.debug_struct("Tls").field("cert", cert).field("key", key).finish(),
            Step::SocketActivation(env) => f.debug_tuple("SocketActivation").field(env).finish(),
            Step::Handler(_) => f.write_str("Handler(..)"),
            Step::WriteTimeout(d) => f.debug_tuple("WriteTimeout").field(d).finish(),
            Step::Grace(d) => f.debug_tuple("Grace").field(d).finish(),
        }
    }
}

/// Validated server configuration.
#[derive(Default)]
pub struct ServerConfig {
    handler: Option<Router>,
    write_timeout: Option<Duration>,
    grace: Option<Duration>,
    tls: Option<TlsMaterial>,
    tls_paths: Option<(PathBuf, PathBuf)>,
    listeners: Vec<BoundListener>,
}

impl ServerConfig {
    /// Apply `steps` in order. The first failure wins; nothing half-bound
    /// survives it.
    pub fn from_steps(steps: impl IntoIterator<Item = Step>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for step in steps {
            let name = step.name();
            if let Err(err) = step.apply(&mut config) {
                tracing::error!(step = name, error = %err, "Configuration step failed");
                config.release();
                return Err(err);
            }
            tracing::debug!(step = name, "Configuration step applied");
        }

        if config.handler.is_none() {
            config.release();
            return Err(ConfigError::NoHandler);
        }
        if config.listeners.is_empty() {
            config.release();
            return Err(ConfigError::NoListeners);
        }

        if config.tls.is_some() {
            for bound in &mut config.listeners {
                let binding = bound.binding().clone();
                *bound.binding_mut() = binding.with_tls();
            }
        }
        Ok(config)
    }

    /// Close everything bound so far, removing socket files we created.
    fn release(self) {
        for bound in self.listeners {
            let binding = bound.binding().clone();
            drop(bound);
            if let Err(err) = binding.release() {
                tracing::warn!(listener = %binding, error = %err, "Failed to release listener");
            }
        }
    }

    pub fn bindings(&self) -> Vec<ListenerBinding> {
        self.listeners.iter().map(|l| l.binding().clone()).collect()
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    pub fn grace(&self) -> Option<Duration> {
        self.grace
    }

    pub fn tls(&self) -> Option<&TlsMaterial> {
        self.tls.as_ref()
    }

    /// The handler with the write timeout applied.
    #[allow(deprecated)]
    pub(crate) fn service(&self) -> Router {
        let router = self.handler.clone().unwrap_or_default();
        match self.write_timeout {
            Some(timeout) => router.layer(TimeoutLayer::new(timeout)),
            None => router,
        }
    }

    pub(crate) fn into_listeners(self) -> Vec<BoundListener> {
        self.listeners
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listeners", &self.listeners)
            .field("write_timeout", &self.write_timeout)
            .field("grace", &self.grace)
            .field("tls", &self.tls_paths)
            .finish_non_exhaustive()
    }
}
