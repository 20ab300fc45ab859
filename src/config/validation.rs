//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses against the configured IP mode
//! - Validate value ranges (sizes > 0, intervals coherent)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TransportConfig → Result<(), Vec<ValidationError>>

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::TransportConfig;

/// Largest payload a UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    match listener.bind_address.parse::<SocketAddr>() {
        Ok(addr) if !listener.ip_mode.accepts(&addr) => errors.push(ValidationError::new(
            "listener.bind_address",
            format!("{addr} cannot be bound in ip mode {}", listener.ip_mode),
        )),
        Ok(_) => {}
        Err(e) => errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address: {e}", listener.bind_address),
        )),
    }
    if listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }
    if listener.handshake_timeout_ms == 0 {
        errors.push(ValidationError::new("listener.handshake_timeout_ms", "must be > 0"));
    }

    let connection = &config.connection;
    if connection.connect_timeout_ms == 0 {
        errors.push(ValidationError::new("connection.connect_timeout_ms", "must be > 0"));
    }
    if connection.handshake_resend_interval_ms == 0 {
        errors.push(ValidationError::new(
            "connection.handshake_resend_interval_ms",
            "must be > 0",
        ));
    }
    if connection.max_datagram_size < 2 || connection.max_datagram_size > MAX_DATAGRAM_SIZE {
        errors.push(ValidationError::new(
            "connection.max_datagram_size",
            format!("must be within 2..={MAX_DATAGRAM_SIZE}"),
        ));
    }
    if connection.disconnect_timeout_ms > 0
        && connection.keep_alive_interval_ms > 0
        && connection.disconnect_timeout_ms <= connection.keep_alive_interval_ms
    {
        errors.push(ValidationError::new(
            "connection.disconnect_timeout_ms",
            "must exceed keep_alive_interval_ms",
        ));
    }
    if connection.disconnect_timeout_ms > 0 && connection.keep_alive_interval_ms == 0 {
        errors.push(ValidationError::new(
            "connection.disconnect_timeout_ms",
            "liveness checks run on keepalive ticks; enable keep_alive_interval_ms",
        ));
    }

    let observability = &config.observability;
    if !matches!(
        observability.log_level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", observability.log_level),
        ));
    }
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
