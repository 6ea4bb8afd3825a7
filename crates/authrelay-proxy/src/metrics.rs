//! Prometheus metrics for authrelay.
//!
//! Tracks accepted connections, upstream responses and credential activity.
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_int_gauge, Counter, CounterVec, Encoder,
    IntGauge, TextEncoder,
};

lazy_static! {
    /// Client connections handed to the relay
    pub static ref CONNECTIONS_ACCEPTED_TOTAL: Counter = register_counter!(
        "authrelay_connections_accepted_total",
        "Total number of client connections accepted"
    )
    .unwrap();

    /// Connections currently relaying
    pub static ref ACTIVE_CONNECTIONS: IntGauge = register_int_gauge!(
        "authrelay_active_connections",
        "Number of connections currently relaying"
    )
    .unwrap();

    /// Responses returned to clients
    pub static ref RESPONSES_TOTAL: CounterVec = register_counter_vec!(
        "authrelay_responses_total",
        "Total number of responses returned to clients",
        &["status"]
    )
    .unwrap();

    /// Requests resent after a 407 challenge
    pub static ref AUTH_RETRIES_TOTAL: Counter = register_counter!(
        "authrelay_auth_retries_total",
        "Total number of requests resent with refreshed credentials"
    )
    .unwrap();

    /// Calls to the credential source
    pub static ref CREDENTIAL_FETCHES_TOTAL: CounterVec = register_counter_vec!(
        "authrelay_credential_fetches_total",
        "Total number of credential source calls",
        &["result"]  // result: granted|declined
    )
    .unwrap();

    /// CONNECT tunnels established
    pub static ref TUNNELS_TOTAL: Counter = register_counter!(
        "authrelay_tunnels_total",
        "Total number of CONNECT tunnels established"
    )
    .unwrap();

    /// Failed attempts to reach an upstream
    pub static ref UPSTREAM_CONNECT_FAILURES_TOTAL: Counter = register_counter!(
        "authrelay_upstream_connect_failures_total",
        "Total number of failed upstream connection attempts"
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_connection_accepted() {
    CONNECTIONS_ACCEPTED_TOTAL.inc();
}

pub fn connection_started() {
    ACTIVE_CONNECTIONS.inc();
}

pub fn connection_finished() {
    ACTIVE_CONNECTIONS.dec();
}

pub fn record_response(status: u16) {
    RESPONSES_TOTAL
        .with_label_values(&[&status.to_string()])
        .inc();
}

pub fn record_auth_retry() {
    AUTH_RETRIES_TOTAL.inc();
}

pub fn record_credential_fetch(result: &str) {
    CREDENTIAL_FETCHES_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_tunnel() {
    TUNNELS_TOTAL.inc();
}

pub fn record_upstream_connect_failure() {
    UPSTREAM_CONNECT_FAILURES_TOTAL.inc();
}
