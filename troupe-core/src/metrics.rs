// ABOUTME: Prometheus metrics initialization and recording helpers
// ABOUTME: All counters/gauges go through these functions so names stay in one place

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return the render handle for the
/// /metrics endpoint. Call once at startup, before any recording.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    Ok(handle)
}

/// An inbound event passed through the resolver; kind is one of
/// "ignored", "human_direct", "agent_relay", "duplicate"
pub fn record_event_classified(kind: &'static str) {
    counter!("troupe_events_classified_total", "kind" => kind).increment(1);
}

pub fn record_turn_submitted() {
    counter!("troupe_turns_submitted_total").increment(1);
}

pub fn record_turn_retry() {
    counter!("troupe_turn_retries_total").increment(1);
}

pub fn record_turn_failed() {
    counter!("troupe_turns_failed_total").increment(1);
}

/// A platform delivery finished; outcome is one of "delivered",
/// "permission_denied", "not_found", "transient"
pub fn record_delivery(outcome: &'static str) {
    counter!("troupe_deliveries_total", "outcome" => outcome).increment(1);
}

/// A control-surface request completed; outcome is the response class
pub fn record_control_request(endpoint: &'static str, outcome: &'static str) {
    counter!("troupe_control_requests_total", "endpoint" => endpoint, "outcome" => outcome)
        .increment(1);
}

pub fn record_organic_start(outcome: &'static str) {
    counter!("troupe_organic_starts_total", "outcome" => outcome).increment(1);
}

pub fn set_platform_connected(connected: bool) {
    gauge!("troupe_platform_connected").set(if connected { 1.0 } else { 0.0 });
}
