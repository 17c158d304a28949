//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the multiplexing server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind_address: String,

    /// Per-connection timeouts.
    pub timeouts: TimeoutConfig,

    /// Upper bound on request header bytes.
    pub max_header_bytes: usize,

    /// Credential pair for the secure path.
    pub tls: TlsConfig,

    /// Serve HTTP/2 (ALPN `h2` over TLS, prior knowledge in plaintext).
    pub http2: bool,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            timeouts: TimeoutConfig::default(),
            max_header_bytes: 1 << 20,
            tls: TlsConfig::default(),
            http2: true,
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults, bound to `address`.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            bind_address: address.into(),
            ..Self::default()
        }
    }

    /// Set the certificate chain and private key paths.
    pub fn with_tls(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.tls = TlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        };
        self
    }
}

/// Timeout configuration. A value of zero disables the timeout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// From accept until the connection is classified and any TLS
    /// handshake is done, in seconds.
    pub read_secs: u64,

    /// Time allowed to receive a full request header, in seconds.
    pub read_header_secs: u64,

    /// Longest a single write may stall, in seconds.
    pub write_secs: u64,

    /// Longest a read may stall (including between keep-alive requests), in seconds.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_secs: 30,
            read_header_secs: 30,
            write_secs: 30,
            idle_secs: 60,
        }
    }
}

/// Classification and handshake deadline when every timeout is disabled.
pub const CLASSIFY_TIMEOUT_FLOOR: Duration = Duration::from_secs(60);

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl TimeoutConfig {
    /// Every timeout off.
    pub fn disabled() -> Self {
        Self {
            read_secs: 0,
            read_header_secs: 0,
            write_secs: 0,
            idle_secs: 0,
        }
    }

    pub fn read(&self) -> Option<Duration> {
        secs(self.read_secs)
    }

    pub fn read_header(&self) -> Option<Duration> {
        secs(self.read_header_secs)
    }

    pub fn write(&self) -> Option<Duration> {
        secs(self.write_secs)
    }

    pub fn idle(&self) -> Option<Duration> {
        secs(self.idle_secs)
    }

    /// Deadline for the classification byte and the TLS handshake.
    ///
    /// Always bounded: a connection that never speaks is eventually dropped.
    pub fn classify(&self) -> Duration {
        self.read()
            .or_else(|| self.read_header())
            .or_else(|| self.idle())
            .unwrap_or(CLASSIFY_TIMEOUT_FLOOR)
    }
}

/// TLS configuration for the listener. Empty paths disable TLS.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Address for the metrics endpoint.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
