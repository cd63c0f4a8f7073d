//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor::register(handlers)   subscribe to the mapped signals
//!     → exec(token, workload)
//!         ├─ dispatch loop:  signal → handler task → Exit
//!         └─ workload task:  workload(child token) → Exit
//!     → first Exit value wins, everything else is cancelled
//!
//! Typical wiring:
//!     workload       = ServerStart::start
//!     SIGTERM/SIGINT = ServerStop::stop, then Exit::done
//! ```
//!
//! # Design Decisions
//! - One completion channel, read exactly once
//! - Cancellation is cooperative: workloads observe their StopToken
//! - Interrupts carry no built-in meaning: a handler chooses
//!   `Exit::done` or `Exit::fail` explicitly

pub mod shutdown;
pub mod signals;
pub mod supervisor;

pub use shutdown::StopToken;
pub use signals::{Exit, Signal, SignalHandlers};
pub use supervisor::Supervisor;
