//! Metrics definitions for the rendezvous hub.
//!
//! All metrics follow Prometheus naming conventions:
//! - `hub_` prefix
//! - `_total` suffix for counters

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

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
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Connection & Room Metrics (Gauges)
// ============================================================================

/// Set the number of registered WebSocket connections.
///
/// Metric: `hub_connections_active`
pub fn set_connections_active(count: usize) {
    // usize to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_connections_active").set(count as f64);
}

/// Set the number of non-empty rooms.
///
/// Metric: `hub_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_rooms_active").set(count as f64);
}

// ============================================================================
// Relay Metrics (Counters)
// ============================================================================

/// Record a signaling payload handed to its target's connection.
///
/// Metric: `hub_signals_relayed_total`
pub fn record_signal_relayed() {
    counter!("hub_signals_relayed_total").increment(1);
}

/// Record a signaling payload that could not be delivered.
///
/// Metric: `hub_signals_dropped_total`
///
/// The target was not connected or its mailbox was full. Relay is
/// best-effort, so a steady trickle is expected as peers come and go.
pub fn record_signal_dropped() {
    counter!("hub_signals_dropped_total").increment(1);
}

/// Record a screen-share ownership change.
///
/// Metric: `hub_share_changes_total`
/// Labels: `action` (started, stopped, overwritten, owner_left)
pub fn record_share_change(action: &str) {
    counter!("hub_share_changes_total", "action" => action.to_string()).increment(1);
}

// ============================================================================
// Operational Metrics
// ============================================================================

/// Record an event dropped for one connection.
///
/// Metric: `hub_events_dropped_total`
/// Labels: `reason`
///
/// Non-zero values indicate clients that cannot keep up.
pub fn record_event_dropped(reason: &str) {
    counter!("hub_events_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Record an actor panic event.
///
/// Metric: `hub_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("hub_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_helpers_without_recorder() {
        // With no recorder installed every helper is a no-op.
        set_connections_active(3);
        set_rooms_active(1);
        record_signal_relayed();
        record_signal_dropped();
        record_share_change("started");
        record_event_dropped("backpressure");
        record_actor_panic("connection");
    }

    #[test]
    fn test_metrics_are_captured_by_recorder() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_connections_active(2);
            set_rooms_active(1);
            record_signal_relayed();
            record_signal_dropped();
            record_share_change("started");
            record_share_change("stopped");
            record_event_dropped("backpressure");
            record_actor_panic("hub");
        });

        let names: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "hub_connections_active",
            "hub_rooms_active",
            "hub_signals_relayed_total",
            "hub_signals_dropped_total",
            "hub_share_changes_total",
            "hub_events_dropped_total",
            "hub_actor_panics_total",
        ] {
            assert!(
                names.iter().any(|name| name == expected),
                "missing metric {expected}, got {names:?}"
            );
        }
    }
}
