//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (port valid, header limit non-zero)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Half-configured TLS is not an error; the server falls back to plaintext

use crate::config::schema::ServerConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyBindAddress,
    InvalidBindAddress(String),
    ZeroMaxHeaderBytes,
    InvalidMetricsAddress(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyBindAddress => write!(f, "bind_address must not be empty"),
            ValidationError::InvalidBindAddress(a) => {
                write!(f, "bind_address {:?} is not host:port", a)
            }
            ValidationError::ZeroMaxHeaderBytes => write!(f, "max_header_bytes must be greater than zero"),
            ValidationError::InvalidMetricsAddress(a) => {
                write!(f, "observability.metrics_address {:?} is not a socket address", a)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// `host:port` with a numeric port. The host may be a name, IPv4 or `[IPv6]`.
fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((_, port)) => port.parse::<u16>().is_ok(),
        None => false,
    }
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.bind_address.trim().is_empty() {
        errors.push(ValidationError::EmptyBindAddress);
    } else if !is_host_port(&config.bind_address) {
        errors.push(ValidationError::InvalidBindAddress(config.bind_address.clone()));
    }

    if config.max_header_bytes == 0 {
        errors.push(ValidationError::ZeroMaxHeaderBytes);
    }

    let obs = &config.observability;
    if obs.metrics_enabled && obs.metrics_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidMetricsAddress(obs.metrics_address.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
