//! Metrics collection and exposition.
//!
//! # Metrics
//! - `multihttp_connections_accepted_total` (counter): by `transport`
//! - `multihttp_classification_failures_total` (counter)
//! - `multihttp_handshake_failures_total` (counter)
//! - `multihttp_connection_duration_seconds` (histogram): by `transport`
//!
//! Without an installed recorder every call here is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

pub const CONNECTIONS_ACCEPTED: &str = "multihttp_connections_accepted_total";
pub const CLASSIFICATION_FAILURES: &str = "multihttp_classification_failures_total";
pub const HANDSHAKE_FAILURES: &str = "multihttp_handshake_failures_total";
pub const CONNECTION_DURATION: &str = "multihttp_connection_duration_seconds";

/// Install the Prometheus recorder and its scrape listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "metrics endpoint listening");
    Ok(())
}

pub fn record_accepted(transport: &'static str) {
    ::metrics::counter!(CONNECTIONS_ACCEPTED, "transport" => transport).increment(1);
}

pub fn record_classification_failure() {
    ::metrics::counter!(CLASSIFICATION_FAILURES).increment(1);
}

pub fn record_handshake_failure() {
    ::metrics::counter!(HANDSHAKE_FAILURES).increment(1);
}

pub fn record_connection_closed(transport: &'static str, started: Instant) {
    ::metrics::histogram!(CONNECTION_DURATION, "transport" => transport)
        .record(started.elapsed().as_secs_f64());
}
