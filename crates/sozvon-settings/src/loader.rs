//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SozvonSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `SOZVON_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{DuplicateSessionPolicy, SozvonSettings};

/// Resolve the settings file path.
///
/// `SOZVON_SETTINGS` wins; otherwise `~/.sozvon/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(path) = read_env_string("SOZVON_SETTINGS") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".sozvon").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SozvonSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SozvonSettings> {
    let defaults = serde_json::to_value(SozvonSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SozvonSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Out-of-range or unparsable values are logged and ignored.
pub fn apply_env_overrides(settings: &mut SozvonSettings) {
    // ── Relay ───────────────────────────────────────────────────────
    if let Some(v) = read_env_string("SOZVON_RELAY_HOST") {
        settings.relay.host = v;
    }
    if let Some(v) = read_env_u16("SOZVON_RELAY_PORT", 1, 65535) {
        settings.relay.port = v;
    }
    if let Some(v) = read_env_string("SOZVON_DB_PATH") {
        settings.relay.db_path = v;
    }
    if let Some(v) = read_env_usize("SOZVON_QUEUE_CAPACITY", 1, 65_536) {
        settings.relay.socket.queue_capacity = v;
        settings.gateway.socket.queue_capacity = v;
    }
    if let Some(v) = read_env_u64("SOZVON_PONG_WAIT_MS", 10, 3_600_000) {
        settings.relay.socket.pong_wait_ms = v;
        settings.gateway.socket.pong_wait_ms = v;
    }
    if let Some(v) = read_env_policy("SOZVON_DUPLICATE_SESSION") {
        settings.relay.duplicate_session = v;
        settings.gateway.duplicate_session = v;
    }

    // ── Gateway ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("SOZVON_GATEWAY_HOST") {
        settings.gateway.host = v;
    }
    if let Some(v) = read_env_u16("SOZVON_GATEWAY_PORT", 1, 65535) {
        settings.gateway.port = v;
    }
    if let Some(v) = read_env_string("SOZVON_RELAY_URL") {
        settings.gateway.relay_url = v;
    }
    if let Some(v) = read_env_string("SOZVON_AUTH_SERVICE_URL") {
        settings.gateway.auth_service_url = v;
    }
    if let Some(v) = read_env_string("SOZVON_USER_SERVICE_URL") {
        settings.gateway.user_service_url = v;
    }
    if let Some(v) = read_env_string("SOZVON_CHAT_SERVICE_URL") {
        settings.gateway.chat_service_url = v;
    }
    if let Some(v) = read_env_u64("SOZVON_DIAL_TIMEOUT_MS", 1, 600_000) {
        settings.gateway.dial_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("SOZVON_PROXY_TIMEOUT_MS", 1, 600_000) {
        settings.gateway.proxy_timeout_ms = v;
    }

    // ── Auth / logging ──────────────────────────────────────────────
    if let Some(v) = read_env_string("SOZVON_JWT_SECRET") {
        settings.auth.jwt_secret = v;
    }
    if let Some(v) = read_env_string("SOZVON_LOG") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a duplicate-session policy name (`takeover` / `reject_new`).
pub fn parse_policy(val: &str) -> Option<DuplicateSessionPolicy> {
    match val.to_lowercase().replace('-', "_").as_str() {
        "takeover" => Some(DuplicateSessionPolicy::Takeover),
        "reject_new" | "reject" => Some(DuplicateSessionPolicy::RejectNew),
        _ => None,
    }
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

fn read_env_policy(name: &str) -> Option<DuplicateSessionPolicy> {
    let val = std::env::var(name).ok()?;
    let result = parse_policy(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "unknown duplicate-session policy, ignoring");
    }
    result
}
