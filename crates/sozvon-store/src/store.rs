//! `SQLite`-backed [`ChatStore`].

use std::path::Path;

use async_trait::async_trait;
use rusqlite::Connection;
use sozvon_core::Identity;
use tracing::debug;

use crate::errors::{Result, StoreError};
use crate::sqlite::connection::{self, ConnectionConfig, ConnectionPool};
use crate::sqlite::migrations::run_migrations;
use crate::sqlite::repositories::{MessageRepo, RoomRepo};
use crate::types::{ChatSummary, Room, StoredMessage};
use crate::ChatStore;

/// [`ChatStore`] over an `r2d2` pool of `SQLite` connections.
#[derive(Clone)]
pub struct SqliteChatStore {
    pool: ConnectionPool,
}

impl SqliteChatStore {
    /// Wrap an existing pool and apply pending migrations.
    pub fn new(pool: ConnectionPool) -> Result<Self> {
        let conn = pool.get()?;
        let applied = run_migrations(&conn)?;
        debug!(applied, "chat store ready");
        drop(conn);
        Ok(Self { pool })
    }

    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Internal(format!("create {}: {e}", parent.display())))?;
        }
        let path = path
            .to_str()
            .ok_or_else(|| StoreError::Internal(format!("non-UTF-8 path: {}", path.display())))?;
        Self::new(connection::new_file(path, &ConnectionConfig::default())?)
    }

    /// Private in-memory database (for tests).
    pub fn in_memory() -> Result<Self> {
        Self::new(connection::new_in_memory(&ConnectionConfig::default())?)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn members(&self, chat_id: &str) -> Result<Vec<Identity>> {
        let chat_id = chat_id.to_string();
        self.with_conn(move |conn| RoomRepo::members(conn, &chat_id)).await
    }

    async fn save_message(
        &self,
        chat_id: &str,
        sender: &Identity,
        text: &str,
    ) -> Result<StoredMessage> {
        let (chat_id, sender, text) = (chat_id.to_string(), sender.clone(), text.to_string());
        self.with_conn(move |conn| MessageRepo::insert(conn, &chat_id, &sender, &text))
            .await
    }

    async fn try_activate(&self, chat_id: &str) -> Result<bool> {
        let chat_id = chat_id.to_string();
        self.with_conn(move |conn| RoomRepo::activate(conn, &chat_id)).await
    }

    async fn find_room(&self, a: &Identity, b: &Identity) -> Result<Option<String>> {
        let (a, b) = (a.clone(), b.clone());
        self.with_conn(move |conn| RoomRepo::find_direct(conn, &a, &b)).await
    }

    async fn create_room(&self, members: &[Identity]) -> Result<Room> {
        let members = members.to_vec();
        self.with_conn(move |conn| RoomRepo::create(conn, &members, false))
            .await
    }

    async fn room(&self, chat_id: &str) -> Result<Option<Room>> {
        let chat_id = chat_id.to_string();
        self.with_conn(move |conn| RoomRepo::get(conn, &chat_id)).await
    }

    async fn user_chats(&self, login: &Identity) -> Result<Vec<ChatSummary>> {
        let login = login.clone();
        self.with_conn(move |conn| RoomRepo::list_for_user(conn, &login)).await
    }

    async fn chat_messages(
        &self,
        chat_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>> {
        let chat_id = chat_id.to_string();
        self.with_conn(move |conn| MessageRepo::list(conn, &chat_id, limit, offset))
            .await
    }
}
