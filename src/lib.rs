//! Process lifecycle supervision for network servers.
//!
//! Two halves that compose:
//! - [`lifecycle::Supervisor`] races one workload against OS signal handlers
//!   and returns whichever outcome arrives first
//! - [`http::HttpServer`] serves one handler over many listeners (TCP, Unix,
//!   TLS, socket activation) and splits into a `start` workload and a
//!   bounded `stop`

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use error::{ConfigError, ContextError, Error, ListenerError, ShutdownError};
pub use http::{HttpServer, ServerStart, ServerStop, Step};
pub use lifecycle::{Exit, Signal, SignalHandlers, StopToken, Supervisor};
