//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Upgrades refused at the connection limit (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// Fan-out events (counter, labels: channel).
pub const WS_BROADCAST_EVENTS_TOTAL: &str = "ws_broadcast_events_total";
/// Recipients reached per fan-out (histogram, labels: channel).
pub const WS_BROADCAST_RECIPIENTS: &str = "ws_broadcast_recipients";
/// Frames handed to a connection queue (counter, labels: channel).
pub const WS_FRAMES_DELIVERED_TOTAL: &str = "ws_frames_delivered_total";
/// Frame serializations (counter, labels: result = hit | miss | error).
pub const WS_SERIALIZATIONS_TOTAL: &str = "ws_serializations_total";
/// Failed sends (counter, labels: channel).
pub const WS_SEND_FAILURES_TOTAL: &str = "ws_send_failures_total";
/// Connections closed for accumulating drops (counter).
pub const WS_SLOW_CONSUMER_CLOSES_TOTAL: &str = "ws_slow_consumer_closes_total";
/// Inbound frames (counter, labels: type).
pub const WS_INBOUND_FRAMES_TOTAL: &str = "ws_inbound_frames_total";
/// Error frames sent (counter, labels: code).
pub const WS_ERROR_FRAMES_TOTAL: &str = "ws_error_frames_total";
/// Replayed transactions short-circuited by the dedup tracker (counter).
pub const SYNC_DUPLICATE_TRANSACTIONS_TOTAL: &str = "sync_duplicate_transactions_total";
/// Snapshots rejected by the insert-only policy (counter, labels: reason).
pub const SYNC_INSERT_ONLY_REJECTIONS_TOTAL: &str = "sync_insert_only_rejections_total";
/// Module events applied through `client:publish` (counter, labels: action).
pub const SYNC_MODULE_EVENTS_TOTAL: &str = "sync_module_events_total";

/// Record one fan-out and the number of recipients it reached.
#[allow(clippy::cast_precision_loss)]
pub fn record_broadcast(channel: &'static str, delivered: usize) {
    counter!(WS_BROADCAST_EVENTS_TOTAL, "channel" => channel).increment(1);
    histogram!(WS_BROADCAST_RECIPIENTS, "channel" => channel).record(delivered as f64);
}
