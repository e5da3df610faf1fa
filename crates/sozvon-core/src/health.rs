//! `/health` response body shared by both services.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Health check response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Which service answered, `"relay"` or `"gateway"`.
    pub service: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket connections (relay) or tunnels (gateway).
    pub connections: usize,
}

/// Build a health response from live counters.
pub fn health_check(service: &str, start_time: Instant, connections: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        service: service.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
    }
}
