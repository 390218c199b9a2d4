//! Metrics collection and exposition.
//!
//! # Metrics
//! - `wirelink_connections_accepted_total` (counter)
//! - `wirelink_connections_rejected_total` (counter): by reason (blacklist, capacity)
//! - `wirelink_handshake_failures_total` (counter): by kind (timeout, mismatch, ...)
//! - `wirelink_tls_failures_total` (counter)
//! - `wirelink_active_sessions` (gauge)
//! - `wirelink_lines_received_total` / `wirelink_lines_sent_total` (counters)
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_connection_accepted() {
    ::metrics::counter!("wirelink_connections_accepted_total").increment(1);
}

pub fn record_connection_rejected(reason: &'static str) {
    ::metrics::counter!("wirelink_connections_rejected_total", "reason" => reason).increment(1);
}

pub fn record_handshake_failure(kind: &'static str) {
    ::metrics::counter!("wirelink_handshake_failures_total", "kind" => kind).increment(1);
}

pub fn record_tls_failure() {
    ::metrics::counter!("wirelink_tls_failures_total").increment(1);
}

pub fn session_activated() {
    ::metrics::gauge!("wirelink_active_sessions").increment(1.0);
}

pub fn session_deactivated() {
    ::metrics::gauge!("wirelink_active_sessions").decrement(1.0);
}

pub fn record_line_received() {
    ::metrics::counter!("wirelink_lines_received_total").increment(1);
}

pub fn record_line_sent() {
    ::metrics::counter!("wirelink_lines_sent_total").increment(1);
}
