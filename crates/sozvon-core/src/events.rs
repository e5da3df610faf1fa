//! Wire events exchanged over the `/ws` socket.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.
//! Inbound and outbound sets are closed enums; anything that does not decode
//! into [`ClientEvent`] is rejected at the boundary with a [`DecodeError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum message length, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 4000;

// ── Error codes carried in `error` events ───────────────────────────

/// Malformed frame or payload failing validation.
pub const VALIDATION_ERROR: &str = "validation_error";
/// The referenced chat has no members / does not exist.
pub const CHAT_NOT_FOUND: &str = "chat_not_found";
/// The sender is not a member of the chat.
pub const FORBIDDEN: &str = "forbidden";
/// The chat store failed.
pub const DATABASE_ERROR: &str = "database_error";

/// Events a client may send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Post a message into a chat.
    #[serde(rename = "message:send")]
    MessageSend(SendMessage),
    /// The sender started typing.
    #[serde(rename = "typing:start")]
    TypingStart(TypingRequest),
    /// The sender stopped typing.
    #[serde(rename = "typing:stop")]
    TypingStop(TypingRequest),
}

impl ClientEvent {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(text).map_err(|e| DecodeError(e.to_string()))
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageSend(_) => "message:send",
            Self::TypingStart(_) => "typing:start",
            Self::TypingStop(_) => "typing:stop",
        }
    }
}

/// A frame that is not a known [`ClientEvent`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid event: {0}")]
pub struct DecodeError(pub String);

/// `message:send` payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Target chat.
    #[serde(default)]
    pub chat_id: String,
    /// Message body.
    #[serde(default)]
    pub text: String,
}

impl SendMessage {
    /// Check the payload shape before any store access.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.chat_id.is_empty() {
            return Err(ValidationError::MissingChatId);
        }
        if self.text.is_empty() {
            return Err(ValidationError::EmptyText);
        }
        if self.text.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(ValidationError::TooLong {
                max: MAX_MESSAGE_LENGTH,
            });
        }
        Ok(())
    }
}

/// Why a `message:send` payload was rejected.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// `chatId` absent or empty.
    #[error("chat ID is required")]
    MissingChatId,
    /// `text` absent or empty.
    #[error("message cannot be empty")]
    EmptyText,
    /// `text` longer than the limit.
    #[error("message too long (max {max} characters)")]
    TooLong {
        /// Character limit.
        max: usize,
    },
}

/// `typing:start` / `typing:stop` payload sent by clients.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    /// Chat being typed into.
    #[serde(default)]
    pub chat_id: String,
}

/// Events the relay pushes to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// A message was persisted in a chat.
    #[serde(rename = "message:new")]
    MessageNew(MessageNew),
    /// A chat received its first message and became active.
    #[serde(rename = "chat:created")]
    ChatCreated(ChatCreated),
    /// Another member started typing.
    #[serde(rename = "typing:start")]
    TypingStart(Typing),
    /// Another member stopped typing.
    #[serde(rename = "typing:stop")]
    TypingStop(Typing),
    /// A request from this client failed.
    #[serde(rename = "error")]
    Error(ErrorBody),
}

impl ServerEvent {
    /// Build an `error` event.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(ErrorBody {
            error: code.into(),
            message: message.into(),
        })
    }

    /// Build a `chat:created` event.
    pub fn chat_created(chat_id: impl Into<String>) -> Self {
        Self::ChatCreated(ChatCreated {
            chat_id: chat_id.into(),
        })
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageNew(_) => "message:new",
            Self::ChatCreated(_) => "chat:created",
            Self::TypingStart(_) => "typing:start",
            Self::TypingStop(_) => "typing:stop",
            Self::Error(_) => "error",
        }
    }

    /// Serialize to a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `message:new` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNew {
    /// Store-assigned message id.
    pub id: String,
    /// Chat the message belongs to.
    pub chat_id: String,
    /// Sender login.
    pub from: String,
    /// Message body.
    pub text: String,
    /// RFC 3339 timestamp assigned by the store.
    pub created_at: String,
}

/// `chat:created` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCreated {
    /// The chat that became active.
    pub chat_id: String,
}

/// Outbound typing indicator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    /// Chat being typed into.
    pub chat_id: String,
    /// Who is typing.
    pub from: String,
}

/// `error` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code, e.g. [`VALIDATION_ERROR`].
    pub error: String,
    /// Human-readable description.
    pub message: String,
}
