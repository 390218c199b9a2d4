//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Check addresses and blacklist entries parse
//! - Check TLS settings are complete when TLS is enabled
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: WirelinkConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::WirelinkConfig;
use crate::security::blacklist::Blacklist;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
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

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Check `config`, collecting every problem found.
pub fn validate_config(config: &WirelinkConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let server = &config.server;
    if server.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "server.bind_address",
            format!("{:?} is not a socket address", server.bind_address),
        ));
    }
    if server.max_connections == 0 {
        errors.push(ValidationError::new("server.max_connections", "must be greater than 0"));
    }
    if server.handshake_timeout_ms == 0 {
        errors.push(ValidationError::new("server.handshake_timeout_ms", "must be greater than 0"));
    }
    if server.max_line_bytes == 0 {
        errors.push(ValidationError::new("server.max_line_bytes", "must be greater than 0"));
    }
    if server.shutdown_notice.contains(['\r', '\n']) {
        errors.push(ValidationError::new("server.shutdown_notice", "must be a single line"));
    }
    if server.notice_timeout_ms == 0 {
        errors.push(ValidationError::new("server.notice_timeout_ms", "must be greater than 0"));
    }
    if server.event_capacity == 0 {
        errors.push(ValidationError::new("server.event_capacity", "must be greater than 0"));
    }
    if let Err(e) = Blacklist::from_entries(&server.blacklist) {
        errors.push(ValidationError::new("server.blacklist", e.to_string()));
    }

    let tls = &config.tls;
    if tls.enabled {
        if tls.cert_path.is_empty() {
            errors.push(ValidationError::new("tls.cert_path", "required when TLS is enabled"));
        }
        if tls.key_path.is_empty() {
            errors.push(ValidationError::new("tls.key_path", "required when TLS is enabled"));
        }
    }
    if tls.handshake_timeout_ms == 0 {
        errors.push(ValidationError::new("tls.handshake_timeout_ms", "must be greater than 0"));
    }

    let client = &config.client;
    if client.host.is_empty() {
        errors.push(ValidationError::new("client.host", "must not be empty"));
    }
    if client.port == 0 {
        errors.push(ValidationError::new("client.port", "must be greater than 0"));
    }
    if client.connect_timeout_ms == 0 {
        errors.push(ValidationError::new("client.connect_timeout_ms", "must be greater than 0"));
    }
    if client.reconnect.base_delay_ms > client.reconnect.max_delay_ms {
        errors.push(ValidationError::new(
            "client.reconnect",
            "base_delay_ms must not exceed max_delay_ms",
        ));
    }

    let observability = &config.observability;
    if !LOG_LEVELS.contains(&observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level {:?}", observability.log_level),
        ));
    }
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
