//! `SQLite` backend for the chat store.
//!
//! - **[`connection`]**: `r2d2` pool with pragmas applied to every connection.
//! - **[`migrations`]**: version-tracked schema, embedded at compile time.
//! - **[`repositories`]**: stateless repositories taking `&Connection`.

pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{ConnectionConfig, ConnectionPool, PooledConnection, new_file, new_in_memory};
pub use migrations::{current_version, latest_version, run_migrations};
