//! Configuration file subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → WrapperConfig (validated, immutable)
//!     → WrapperConfig::steps → http::Step list for the server builder
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Sockets are bound by the steps, never by loading

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, LoadError};
pub use schema::{ListenerConfig, TlsConfig, WrapperConfig};
pub use validation::ValidationError;
