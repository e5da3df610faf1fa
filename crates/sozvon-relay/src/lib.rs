//! # sozvon-relay
//!
//! The real-time relay: authenticated WebSocket connections, the identity
//! hub, and the router that persists and fans out chat events.
//!
//! - [`websocket::connection`]: per-socket handle with a bounded outbound queue
//! - [`websocket::hub`]: identity → connection directory behind one dispatcher
//! - [`websocket::session`]: inbound and outbound socket pumps
//! - [`router`]: validation, authorization, persistence, fan-out
//! - [`api`]: chat REST endpoints
//! - [`server`]: Axum router, listener and graceful shutdown

#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod router;
pub mod server;
pub mod websocket;

pub use config::RelayConfig;
pub use errors::{ApiError, RouteError};
pub use router::MessageRouter;
pub use server::RelayServer;
pub use websocket::connection::Connection;
pub use websocket::hub::{Hub, RegisterOutcome};
