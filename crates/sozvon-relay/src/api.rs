//! Chat REST endpoints served next to `/ws`.
//!
//! - `POST /chats/create` opens (or finds) the direct chat between the caller
//!   and another login
//! - `GET /chats` lists the caller's active chats
//! - `GET /chats/{id}/messages` pages through a chat's history
//!
//! All routes require `Authorization: Bearer <token>`.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use sozvon_core::Identity;
use sozvon_store::{ChatSummary, StoredMessage};
use tracing::info;

use crate::errors::ApiError;
use crate::server::{AppState, bearer_token};

/// Default page size for history.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
/// Largest page size accepted.
pub const MAX_HISTORY_LIMIT: u32 = 200;

/// `POST /chats/create` body.
#[derive(Debug, Deserialize)]
pub struct CreateChatRequest {
    /// Initiator; must match the caller when present.
    #[serde(default)]
    pub from: Option<String>,
    /// The other participant.
    #[serde(default)]
    pub to: String,
}

/// `POST /chats/create` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateChatResponse {
    /// Chat id.
    pub id: String,
    /// Both participants.
    pub members: Vec<Identity>,
    /// Whether the chat already has messages.
    pub active: bool,
    /// Whether this request created the chat.
    pub created: bool,
}

/// `GET /chats/{id}/messages` query.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    /// Page size, clamped to `1..=200`.
    pub limit: Option<u32>,
    /// Messages to skip.
    pub offset: Option<u32>,
}

fn caller(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;
    Ok(state.identity.validate_token(token)?)
}

/// `POST /chats/create`
pub async fn create_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateChatRequest>, JsonRejection>,
) -> Result<Json<CreateChatResponse>, ApiError> {
    let me = caller(&state, &headers)?;
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    if let Some(from) = req.from.as_deref().filter(|f| !f.is_empty()) {
        if me != from {
            return Err(ApiError::BadRequest("from must be the authenticated user".into()));
        }
    }
    if req.to.is_empty() {
        return Err(ApiError::BadRequest("to is required".into()));
    }
    if me == req.to {
        return Err(ApiError::BadRequest("cannot create chat with yourself".into()));
    }

    let other = Identity::new(req.to);
    let (room, created) = state
        .store()
        .open_direct_room(&me, &other)
        .await
        .map_err(ApiError::store("Failed to create chat"))?;
    if created {
        info!(chat_id = %room.id, from = %me, to = %other, "chat created");
    }
    Ok(Json(CreateChatResponse {
        id: room.id,
        members: room.members,
        active: room.active,
        created,
    }))
}

/// `GET /chats`
pub async fn list_chats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatSummary>>, ApiError> {
    let me = caller(&state, &headers)?;
    let chats = state
        .store()
        .user_chats(&me)
        .await
        .map_err(ApiError::store("Failed to get chats"))?;
    Ok(Json(chats))
}

/// `GET /chats/{id}/messages`
pub async fn chat_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    let me = caller(&state, &headers)?;
    let room = state
        .store()
        .room(&chat_id)
        .await
        .map_err(ApiError::store("Failed to get chat"))?
        .ok_or(ApiError::NotFound)?;
    if !room.members.contains(&me) {
        return Err(ApiError::Forbidden);
    }

    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let messages = state
        .store()
        .chat_messages(&chat_id, limit, params.offset.unwrap_or(0))
        .await
        .map_err(ApiError::store("Failed to get messages"))?;
    Ok(Json(messages))
}
