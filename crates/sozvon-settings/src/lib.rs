//! # sozvon-settings
//!
//! Configuration for the relay and the gateway, loaded from three layers
//! (in priority order):
//! 1. **Compiled defaults**: [`SozvonSettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: `SOZVON_*` overrides (highest priority)
//!
//! Settings are loaded once at startup and passed to the services
//! explicitly; there is no global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
