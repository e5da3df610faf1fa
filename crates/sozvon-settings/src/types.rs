//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may contain any subset of fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "relay": { "port": 9000, "duplicateSession": "reject_new" },
///   "auth": { "jwtSecret": "…" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SozvonSettings {
    /// Relay core (chat service) settings.
    pub relay: RelaySettings,
    /// Edge gateway settings.
    pub gateway: GatewaySettings,
    /// Token validation settings.
    pub auth: AuthSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl SozvonSettings {
    /// Reject combinations the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            return Err(SettingsError::InvalidValue(
                "auth.jwtSecret must be set (SOZVON_JWT_SECRET)".into(),
            ));
        }
        self.relay.socket.validate("relay")?;
        self.gateway.socket.validate("gateway")?;
        if self.gateway.dial_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "gateway.dialTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// What to do when an identity that is already connected connects again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateSessionPolicy {
    /// Evict the existing connection and keep the new one.
    #[default]
    Takeover,
    /// Refuse the new connection with `409 Conflict`.
    RejectNew,
}

/// Per-socket timing and buffering, shared by relay and gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketSettings {
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    /// Deadline for a single frame write, in milliseconds.
    pub write_wait_ms: u64,
    /// Read deadline refreshed by each pong, in milliseconds.
    pub pong_wait_ms: u64,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            write_wait_ms: 10_000,
            pong_wait_ms: 60_000,
            max_message_size: 512 * 1024,
        }
    }
}

impl SocketSettings {
    /// Write deadline.
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    /// Read deadline window.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Ping period, 9/10 of the pong window so a pong can arrive in time.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(format!(
                "{section}.queueCapacity must be positive"
            )));
        }
        if self.pong_wait_ms < 10 {
            return Err(SettingsError::InvalidValue(format!(
                "{section}.pongWaitMs must be at least 10"
            )));
        }
        if self.write_wait_ms == 0 {
            return Err(SettingsError::InvalidValue(format!(
                "{section}.writeWaitMs must be positive"
            )));
        }
        Ok(())
    }
}

/// Relay core settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Path to the `SQLite` chat database.
    pub db_path: String,
    /// Socket timing and buffering.
    pub socket: SocketSettings,
    /// Capacity of the hub command queue.
    pub hub_capacity: usize,
    /// Duplicate-session policy.
    pub duplicate_session: DuplicateSessionPolicy,
    /// Upper bound on graceful shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8084,
            db_path: "sozvon.db".to_string(),
            socket: SocketSettings::default(),
            hub_capacity: 1024,
            duplicate_session: DuplicateSessionPolicy::Takeover,
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// Edge gateway settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Base WebSocket URL of the relay, e.g. `ws://127.0.0.1:8084`.
    pub relay_url: String,
    /// Upstream for `/auth/*`.
    pub auth_service_url: String,
    /// Upstream for `/users/*`.
    pub user_service_url: String,
    /// Upstream for `/chats*`.
    pub chat_service_url: String,
    /// Timeout for establishing the upstream socket, in milliseconds.
    pub dial_timeout_ms: u64,
    /// Timeout for proxied HTTP requests, in milliseconds.
    pub proxy_timeout_ms: u64,
    /// Client-facing socket timing and buffering.
    pub socket: SocketSettings,
    /// Duplicate-session policy.
    pub duplicate_session: DuplicateSessionPolicy,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            relay_url: "ws://127.0.0.1:8084".to_string(),
            auth_service_url: "http://localhost:8082".to_string(),
            user_service_url: "http://localhost:8083".to_string(),
            chat_service_url: "http://localhost:8084".to_string(),
            dial_timeout_ms: 10_000,
            proxy_timeout_ms: 30_000,
            socket: SocketSettings::default(),
            duplicate_session: DuplicateSessionPolicy::Takeover,
        }
    }
}

impl GatewaySettings {
    /// Dial timeout for the upstream socket.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Timeout for proxied HTTP requests.
    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_timeout_ms)
    }
}

/// Token validation settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HMAC secret shared with the token issuer.
    pub jwt_secret: String,
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
