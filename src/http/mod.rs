//! HTTP serving subsystem.
//!
//! # Data Flow
//! ```text
//! [Step, Step, ...]
//!     → builder.rs (apply in order, first failure wins)
//!     → ServerConfig (immutable)
//!     → server.rs HttpServer → (ServerStart, ServerStop)
//!
//! ServerStart::start:  accept loop per listener → hyper connection → handler
//! ServerStop::stop:    close listeners → grace → drain → bounded wait
//! ```
//!
//! # Design Decisions
//! - The request handler is supplied by the caller as an `axum::Router`
//! - HTTP/1.1 and HTTP/2 via hyper-util's auto connection builder
//! - Write timeout enforced with tower-http's timeout layer

pub mod builder;
pub mod server;

pub use builder::{ServerConfig, Step};
pub use server::{HttpServer, ServerStart, ServerStop};
