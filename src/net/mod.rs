//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Configuration step
//!     → listener.rs (bind TCP / Unix) or activation.rs (adopt passed fds)
//!     → BoundListener (not yet registered with the runtime)
//!
//! ServerStart::start
//!     → Listener (one accept loop each)
//!     → tls.rs (optional TLS handshake, shared policy)
//!     → connection.rs (tracked for graceful shutdown)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Binding happens at configuration time so failures surface early
//! - TLS is all-or-nothing per server and uses one immutable profile
//! - Each connection tracked for graceful shutdown

pub mod activation;
pub mod connection;
pub mod listener;
pub mod tls;

pub use activation::ActivationEnv;
pub use listener::ListenerBinding;
pub use tls::{TlsProfile, TLS_PROFILE};
