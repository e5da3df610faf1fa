//! # sozvon-store
//!
//! Persistence for chat rooms and messages.
//!
//! The relay depends only on the [`ChatStore`] trait; [`SqliteChatStore`]
//! is the shipped implementation. Queries are synchronous `rusqlite` calls
//! run on the blocking pool.

#![deny(unsafe_code)]

pub mod errors;
pub mod sqlite;
pub mod store;
pub mod types;

pub use errors::{Result, StoreError};
pub use store::SqliteChatStore;
pub use types::{ChatSummary, Room, StoredMessage};

use async_trait::async_trait;
use sozvon_core::Identity;

/// Storage operations the relay needs.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Members of a room. Unknown rooms yield an empty list, not an error.
    async fn members(&self, chat_id: &str) -> Result<Vec<Identity>>;

    /// Persist a message and return it with its assigned id and timestamp.
    async fn save_message(&self, chat_id: &str, sender: &Identity, text: &str)
    -> Result<StoredMessage>;

    /// Atomically mark a room active. `true` only for the call that flipped it.
    async fn try_activate(&self, chat_id: &str) -> Result<bool>;

    /// Id of a room both identities belong to.
    async fn find_room(&self, a: &Identity, b: &Identity) -> Result<Option<String>>;

    /// Create an inactive room with the given members.
    async fn create_room(&self, members: &[Identity]) -> Result<Room>;

    /// Fetch a room by id.
    async fn room(&self, chat_id: &str) -> Result<Option<Room>>;

    /// Active rooms of `login`, newest activity first.
    async fn user_chats(&self, login: &Identity) -> Result<Vec<ChatSummary>>;

    /// Messages of a room, oldest first.
    async fn chat_messages(&self, chat_id: &str, limit: u32, offset: u32)
    -> Result<Vec<StoredMessage>>;

    /// Return the room shared by `a` and `b`, creating it if absent.
    ///
    /// The flag is `true` when the room was created by this call.
    async fn open_direct_room(&self, a: &Identity, b: &Identity) -> Result<(Room, bool)> {
        if let Some(id) = self.find_room(a, b).await? {
            if let Some(room) = self.room(&id).await? {
                return Ok((room, false));
            }
        }
        let room = self.create_room(&[a.clone(), b.clone()]).await?;
        Ok((room, true))
    }
}

/// Store timestamp: RFC 3339, UTC, microsecond precision.
///
/// Fixed width so lexical order matches chronological order.
pub(crate) fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
