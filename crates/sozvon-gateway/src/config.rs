//! Gateway server configuration.

use std::time::Duration;

use sozvon_settings::{DuplicateSessionPolicy, GatewaySettings, SocketSettings};

/// Runtime configuration for [`crate::server::GatewayServer`].
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Base WebSocket URL of the relay.
    pub relay_url: String,
    /// Upstream for `/auth/*`.
    pub auth_service_url: String,
    /// Upstream for `/users/*`.
    pub user_service_url: String,
    /// Upstream for `/chats*`.
    pub chat_service_url: String,
    /// Upstream handshake deadline.
    pub dial_timeout: Duration,
    /// Proxied request deadline.
    pub proxy_timeout: Duration,
    /// Client-facing queue and socket timings.
    pub socket: SocketSettings,
    /// What to do when an identity connects twice.
    pub duplicate_session: DuplicateSessionPolicy,
    /// Upper bound on the wait for tunnels during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&GatewaySettings {
            host: "127.0.0.1".into(),
            port: 0,
            ..GatewaySettings::default()
        })
    }
}

impl From<&GatewaySettings> for GatewayConfig {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            relay_url: settings.relay_url.clone(),
            auth_service_url: settings.auth_service_url.clone(),
            user_service_url: settings.user_service_url.clone(),
            chat_service_url: settings.chat_service_url.clone(),
            dial_timeout: settings.dial_timeout(),
            proxy_timeout: settings.proxy_timeout(),
            socket: settings.socket.clone(),
            duplicate_session: settings.duplicate_session,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
