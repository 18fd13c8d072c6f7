//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup, before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Events published to viewers (counter, labels: type).
pub const EVENTS_PUBLISHED_TOTAL: &str = "events_published_total";
/// Events placed on a session queue (counter, labels: component, priority).
pub const EVENTS_QUEUED_TOTAL: &str = "events_queued_total";
/// Session queues flushed (counter, labels: component, trigger).
pub const QUEUE_FLUSHES_TOTAL: &str = "queue_flushes_total";
/// Publish failures (counter, labels: component).
pub const PUBLISH_ERRORS_TOTAL: &str = "publish_errors_total";
/// Critical status delivery latency seconds (histogram).
pub const CRITICAL_LATENCY_SECONDS: &str = "critical_latency_seconds";
/// Immediate decision delivery latency seconds (histogram, labels: importance).
pub const DECISION_LATENCY_SECONDS: &str = "decision_latency_seconds";
/// Immediate decisions over the latency threshold (counter).
pub const DECISION_LATENCY_BREACHES_TOTAL: &str = "decision_latency_breaches_total";
/// Rate limiter denials (counter, labels: operation).
pub const RATE_LIMIT_DENIALS_TOTAL: &str = "rate_limit_denials_total";
/// Scheduler ticks (counter, labels: cadence).
pub const SCHEDULER_TICKS_TOTAL: &str = "scheduler_ticks_total";
/// Watched sessions skipped for lack of subscribers (counter).
pub const SCHEDULER_SKIPPED_SESSIONS_TOTAL: &str = "scheduler_skipped_sessions_total";
/// Collaborator lookup failures (counter, labels: operation).
pub const LOOKUP_ERRORS_TOTAL: &str = "lookup_errors_total";
/// Sessions moved to cold storage (counter, labels: status).
pub const SESSIONS_ARCHIVED_TOTAL: &str = "sessions_archived_total";
/// Watched sessions (gauge).
pub const WATCHED_SESSIONS: &str = "watched_sessions";
/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Broadcast drops total (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// WebSocket connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
