//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0)
//! - Require at least one listener source
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: WrapperConfig → Result<(), Vec<ValidationError>>
//! - Runs before any socket is bound

use std::fmt;

use crate::config::schema::{ListenerConfig, WrapperConfig};

/// A single semantic problem in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &WrapperConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listeners.is_empty() && !config.socket_activation {
        errors.push(ValidationError::new(
            "listeners",
            "at least one listener or socket_activation is required",
        ));
    }

    for (i, listener) in config.listeners.iter().enumerate() {
        if let ListenerConfig::Unix { path } = listener {
            if path.as_os_str().is_empty() {
                errors.push(ValidationError::new(format!("listeners[{i}].path"), "must not be empty"));
            }
        }
    }

    if let Some(tls) = &config.tls {
        if tls.cert_path.as_os_str().is_empty() {
            errors.push(ValidationError::new("tls.cert_path", "must not be empty"));
        }
        if tls.key_path.as_os_str().is_empty() {
            errors.push(ValidationError::new("tls.key_path", "must not be empty"));
        }
    }

    if config.write_timeout_secs == Some(0) {
        errors.push(ValidationError::new("write_timeout_secs", "must be greater than zero"));
    }
    if config.shutdown_timeout_secs == 0 {
        errors.push(ValidationError::new("shutdown_timeout_secs", "must be greater than zero"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
