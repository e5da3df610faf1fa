//! # sozvon-core
//!
//! Foundation types shared by the relay and the gateway:
//!
//! - [`events`]: the closed set of wire events exchanged over `/ws`
//! - [`health`]: the `/health` response body
//! - [`identity`]: the login-based routing key
//! - [`logging`]: `tracing` subscriber initialization
//! - [`shutdown`]: process-wide cancellation and task draining

#![deny(unsafe_code)]

pub mod events;
pub mod health;
pub mod identity;
pub mod logging;
pub mod shutdown;

pub use events::{ClientEvent, DecodeError, ErrorBody, ServerEvent, ValidationError};
pub use health::HealthResponse;
pub use identity::Identity;
pub use shutdown::ShutdownCoordinator;
