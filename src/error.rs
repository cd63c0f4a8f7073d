//! Error taxonomy.
//!
//! # Categories
//! ```text
//! ConfigError    → build time, start/stop never attempt partial startup
//! ListenerError  → an accept loop ended abnormally
//! ShutdownError  → a listener failed to close / drain exceeded its bound
//! ContextError   → the caller's StopToken was cancelled or expired
//! ```
//!
//! # Design Decisions
//! - Errors from independent listeners are joined, never reduced to the first
//! - A graceful close is not an error and is never reported as one

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Invalid server configuration, detected while applying configuration steps.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid certificate file {0:?}")]
    InvalidCertificate(PathBuf),

    #[error("invalid key file {0:?}")]
    InvalidKey(PathBuf),

    /// The PEM material exists but cannot be turned into a TLS server config.
    #[error("unusable TLS material: {0}")]
    Tls(String),

    #[error("failed to bind {target}: {source}")]
    Bind {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("socket activation: {0}")]
    Activation(String),

    #[error("descriptor {fd} is not a listening stream socket")]
    NotASocket { fd: i32 },

    #[error("no listeners have been configured")]
    NoListeners,

    #[error("no request handler has been configured")]
    NoHandler,
}

/// An accept loop terminated for a reason other than shutdown.
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("accept failed on {listener}: {source}")]
    Accept {
        listener: String,
        #[source]
        source: io::Error,
    },

    #[error("listener {listener} could not be registered with the runtime: {source}")]
    Register {
        listener: String,
        #[source]
        source: io::Error,
    },

    /// The accept task ended without reporting (it panicked or was aborted).
    #[error("accept task for {listener} ended unexpectedly")]
    Lost { listener: String },
}

/// Failure while tearing the server down.
#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("failed to close listener {listener}: {source}")]
    Close {
        listener: String,
        #[source]
        source: io::Error,
    },

    #[error("graceful shutdown incomplete: {open} connection(s) still open")]
    Incomplete { open: usize },
}

/// Caller-side cancellation of a [`StopToken`](crate::lifecycle::StopToken).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Top level error returned by the server lifecycle.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error(transparent)]
    Context(#[from] ContextError),

    /// Several independent failures, in the order they were collected.
    #[error("{}", Joined(.0))]
    Joined(Vec<Error>),

    /// Failure reported by a signal handler or workload in the daemon binary.
    #[error("{0}")]
    Aborted(String),
}

impl Error {
    /// Folds collected errors into one result.
    ///
    /// No errors is success, a single error is returned as is, anything more
    /// is wrapped in [`Error::Joined`].
    pub fn join(mut errors: Vec<Error>) -> Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Joined(errors)),
        }
    }

    /// Flattened view of every leaf error.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Error> + '_> {
        match self {
            Error::Joined(errors) => Box::new(errors.iter().flat_map(Error::iter)),
            other => Box::new(std::iter::once(other)),
        }
    }

    /// Returns `true` when the error is, or contains, a [`ContextError`].
    pub fn is_context(&self) -> bool {
        self.iter().any(|e| matches!(e, Error::Context(_)))
    }
}

struct Joined<'a>(&'a [Error]);

impl fmt::Display for Joined<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        Error::Joined(errors)
    }
}
