//! Public record types returned by the store.

use serde::{Deserialize, Serialize};
use sozvon_core::Identity;

/// A chat room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    /// Room id.
    pub id: String,
    /// Member logins.
    pub members: Vec<Identity>,
    /// Whether the room has received its first message.
    pub active: bool,
    /// RFC 3339 creation time.
    pub created_at: String,
}

/// A persisted message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Message id (UUID v7).
    pub id: String,
    /// Room the message belongs to.
    pub chat_id: String,
    /// Sender login.
    #[serde(rename = "from")]
    pub sender: Identity,
    /// Message body.
    pub text: String,
    /// RFC 3339 creation time, assigned by the store.
    pub created_at: String,
}

/// One row of a user's chat list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    /// Room id.
    pub chat_id: String,
    /// Member logins.
    pub members: Vec<Identity>,
    /// Text of the newest message, empty if none.
    pub last_message: String,
    /// Time of the newest message, or room creation time.
    pub updated_at: String,
}
