//! Gateway metric names.

/// Tunnels opened (counter).
pub const TUNNELS_TOTAL: &str = "gateway_tunnels_total";
/// Live tunnels (gauge).
pub const TUNNELS_ACTIVE: &str = "gateway_tunnels_active";
/// Tunnels aborted because the relay could not be reached (counter).
pub const DIAL_FAILURES_TOTAL: &str = "gateway_dial_failures_total";
/// Frames dropped on a full client queue (counter).
pub const DROPPED_FRAMES_TOTAL: &str = "gateway_dropped_frames_total";
/// Proxied HTTP requests (counter, labels: service, status).
pub const PROXY_REQUESTS_TOTAL: &str = "gateway_proxy_requests_total";
