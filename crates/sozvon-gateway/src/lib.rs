//! # sozvon-gateway
//!
//! The public edge. Each client WebSocket becomes a tunnel to the relay,
//! and the HTTP services sit behind a small reverse proxy.
//!
//! - [`tunnel`]: tunnel registry and the per-client edge session
//! - [`proxy`]: streaming HTTP forwarding with hop-by-hop header stripping
//! - [`server`]: Axum router, listener and graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod tunnel;

pub use config::GatewayConfig;
pub use errors::{GatewayError, Result};
pub use proxy::ProxyClient;
pub use server::GatewayServer;
pub use tunnel::{Admission, EdgeSession, Tunnel, TunnelRegistry};
