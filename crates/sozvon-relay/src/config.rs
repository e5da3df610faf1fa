//! Relay server configuration.

use std::time::Duration;

use sozvon_settings::{DuplicateSessionPolicy, RelaySettings, SocketSettings};

/// Runtime configuration for [`crate::server::RelayServer`].
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Per-connection queue and socket timings.
    pub socket: SocketSettings,
    /// Capacity of the hub command queue.
    pub hub_capacity: usize,
    /// What to do when an identity connects twice.
    pub duplicate_session: DuplicateSessionPolicy,
    /// Upper bound on the wait for sessions during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            socket: SocketSettings::default(),
            hub_capacity: 1024,
            duplicate_session: DuplicateSessionPolicy::Takeover,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&RelaySettings> for RelayConfig {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            socket: settings.socket.clone(),
            hub_capacity: settings.hub_capacity,
            duplicate_session: settings.duplicate_session,
            shutdown_timeout: Duration::from_millis(settings.shutdown_timeout_ms),
        }
    }
}

impl RelayConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
