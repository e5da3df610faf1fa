//! WebSocket connections, the identity hub and the per-socket pumps.

pub mod connection;
pub mod hub;
pub mod session;
