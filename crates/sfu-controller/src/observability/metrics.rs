//! Metrics definitions for the SFU Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 3 values (registry, room, peer)
//! - `kind`: 2 values (audio, video)
//! - `operation`: bounded by engine operations (~12 values)
//! - `reason`: bounded consume rejection reasons (~6 values)
//! - `direction` x `layer`: 2 x 2

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Engine calls cross a process boundary; most finish in a few ms,
        // transport connects and consumer creation can take much longer.
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_engine_operation".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
                15.000,
            ],
        )
        .map_err(|e| format!("Failed to set engine operation buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Peer Metrics (Gauges)
// ============================================================================

/// Set the number of rooms with an active video session.
///
/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// A peer registered in a room.
///
/// Metric: `sfu_peers_active`
pub fn record_peer_joined() {
    gauge!("sfu_peers_active").increment(1.0);
}

/// A peer was removed from its room.
pub fn record_peer_left() {
    gauge!("sfu_peers_active").decrement(1.0);
}

// ============================================================================
// Media Object Metrics (Counters)
// ============================================================================

/// Metric: `sfu_producers_created_total`
/// Labels: `kind`
pub fn record_producer_created(kind: &str) {
    counter!("sfu_producers_created_total", "kind" => kind.to_string()).increment(1);
}

/// Metric: `sfu_producers_closed_total`
/// Labels: `kind`
pub fn record_producer_closed(kind: &str) {
    counter!("sfu_producers_closed_total", "kind" => kind.to_string()).increment(1);
}

/// Metric: `sfu_consumers_created_total`
/// Labels: `kind`
pub fn record_consumer_created(kind: &str) {
    counter!("sfu_consumers_created_total", "kind" => kind.to_string()).increment(1);
}

/// Record a consume request that did not produce a consumer.
///
/// Metric: `sfu_consume_rejected_total`
/// Labels: `reason` (duplicate, producer_gone, cannot_consume, not_ready, peer_gone, engine)
///
/// `duplicate` is expected under concurrent announcements and is not an error.
pub fn record_consume_rejected(reason: &str) {
    counter!("sfu_consume_rejected_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Engine Metrics
// ============================================================================

/// Record the latency of one media engine call.
///
/// Metric: `sfu_engine_operation_latency_seconds`
/// Labels: `operation`
pub fn record_engine_operation(operation: &str, duration: Duration) {
    histogram!("sfu_engine_operation_latency_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `sfu_engine_available` (1 when a worker is running, else 0)
pub fn set_engine_available(available: bool) {
    gauge!("sfu_engine_available").set(if available { 1.0 } else { 0.0 });
}

/// Record a successful worker restart.
///
/// Metric: `sfu_engine_restarts_total`
pub fn record_engine_restart() {
    counter!("sfu_engine_restarts_total").increment(1);
}

/// Record an ICE or DTLS failure on a transport.
///
/// Metric: `sfu_transport_failures_total`
/// Labels: `direction` (send, recv), `layer` (ice, dtls)
pub fn record_transport_failure(direction: &str, layer: &str) {
    counter!(
        "sfu_transport_failures_total",
        "direction" => direction.to_string(),
        "layer" => layer.to_string()
    )
    .increment(1);
}

// ============================================================================
// Actor Metrics
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type` (registry, room, peer)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

/// Record an actor panic event.
///
/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}
