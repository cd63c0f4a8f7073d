//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (listener, signal, connection_id)
//!     → logging.rs subscriber (env filter + fmt to stdout)
//! ```

pub mod logging;
