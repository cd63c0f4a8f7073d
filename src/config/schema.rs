//! Configuration schema definitions.
//!
//! The file form of the server's configuration steps. All types derive Serde
//! traits for deserialization from TOML.

use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use serde::{Deserialize, Serialize};

use crate::http::Step;

/// Root configuration for the wrapped server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WrapperConfig {
    /// Listener definitions, bound in order.
    pub listeners: Vec<ListenerConfig>,

    /// Serve every listener over TLS.
    pub tls: Option<TlsConfig>,

    /// Adopt listeners passed by the service manager (LISTEN_FDS).
    pub socket_activation: bool,

    /// Upper bound on producing a response, in seconds.
    pub write_timeout_secs: Option<u64>,

    /// Pause between closing listeners and draining connections.
    pub grace_ms: Option<u64>,

    /// Upper bound on graceful shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            tls: None,
            socket_activation: false,
            write_timeout_secs: None,
            grace_ms: None,
            shutdown_timeout_secs: 10,
        }
    }
}

/// A single listener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ListenerConfig {
    /// TCP address, e.g. "127.0.0.1:8080". An empty address or a missing
    /// port falls back to :80 or :443.
    Tcp {
        #[serde(default)]
        address: String,
    },
    /// Unix domain socket path.
    Unix { path: PathBuf },
}

/// TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,
}

impl WrapperConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Turn the file into server steps serving `handler`.
    ///
    /// TLS comes first so listeners without a port default to :443.
    pub fn steps(&self, handler: Router) -> Vec<Step> {
        let mut steps = Vec::new();
        if let Some(tls) = &self.tls {
            steps.push(Step::tls(&tls.cert_path, &tls.key_path));
        }
        for listener in &self.listeners {
            steps.push(match listener {
                ListenerConfig::Tcp { address } => Step::tcp(address.as_str()),
                ListenerConfig::Unix { path } => Step::unix(path),
            });
        }
        if self.socket_activation {
            steps.push(Step::socket_activation());
        }
        if let Some(secs) = self.write_timeout_secs {
            steps.push(Step::write_timeout(Duration::from_secs(secs)));
        }
        if let Some(ms) = self.grace_ms {
            steps.push(Step::grace(Duration::from_millis(ms)));
        }
        steps.push(Step::handler(handler));
        steps
    }
}
