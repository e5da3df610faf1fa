//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Call once at startup, before any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle that is not installed globally (tests, embedding).
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "relay_ws_connections_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "relay_ws_disconnections_total";
/// Live WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "relay_ws_connections_active";
/// Connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "relay_ws_connection_duration_seconds";
/// Frames dropped on full outbound queues (counter).
pub const WS_DROPPED_FRAMES_TOTAL: &str = "relay_ws_dropped_frames_total";
/// Connections evicted by a newer session (counter).
pub const WS_TAKEOVERS_TOTAL: &str = "relay_ws_takeovers_total";
/// Messages persisted and fanned out (counter).
pub const MESSAGES_ROUTED_TOTAL: &str = "relay_messages_routed_total";
/// Rejected client events (counter, labels: code).
pub const ROUTE_ERRORS_TOTAL: &str = "relay_route_errors_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_handle_renders() {
        let output = detached_handle().render();
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_DROPPED_FRAMES_TOTAL,
            WS_TAKEOVERS_TOTAL,
            MESSAGES_ROUTED_TOTAL,
            ROUTE_ERRORS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
