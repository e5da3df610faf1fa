//! Relay error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sozvon_auth::AuthError;
use sozvon_core::events::{CHAT_NOT_FOUND, DATABASE_ERROR, FORBIDDEN, VALIDATION_ERROR};
use sozvon_core::{DecodeError, ErrorBody, ValidationError};
use sozvon_store::StoreError;
use thiserror::Error;
use tracing::error;

/// Why a client event was rejected.
///
/// The `Display` text is what the client sees in the `error` event, and the
/// store variants hide the underlying cause.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Payload failed validation.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Frame did not decode into a known event.
    #[error("{0}")]
    Decode(#[from] DecodeError),

    /// The chat has no members.
    #[error("Chat not found")]
    ChatNotFound,

    /// Sender is not a member of the chat.
    #[error("You are not a member of this chat")]
    Forbidden,

    /// Member lookup failed.
    #[error("Failed to get chat members")]
    Members(#[source] StoreError),

    /// Message insert failed.
    #[error("Failed to save message")]
    Save(#[source] StoreError),
}

impl RouteError {
    /// Wire error code for the `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::Decode(_) => VALIDATION_ERROR,
            Self::ChatNotFound => CHAT_NOT_FOUND,
            Self::Forbidden => FORBIDDEN,
            Self::Members(_) | Self::Save(_) => DATABASE_ERROR,
        }
    }
}

/// Errors returned by the HTTP API, rendered as `{error, message}` JSON.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or rejected bearer token.
    #[error("{0}")]
    Unauthorized(String),

    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// Caller is not a member of the chat.
    #[error("You are not a member of this chat")]
    Forbidden,

    /// No such chat.
    #[error("Chat not found")]
    NotFound,

    /// The store failed.
    #[error("{context}")]
    Store {
        /// Client-facing description.
        context: &'static str,
        /// Underlying failure, logged only.
        #[source]
        source: StoreError,
    },
}

impl ApiError {
    /// Wrap a store failure with a client-facing description.
    pub fn store(context: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { context, source }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::BadRequest(_) => VALIDATION_ERROR,
            Self::Forbidden => FORBIDDEN,
            Self::NotFound => CHAT_NOT_FOUND,
            Self::Store { .. } => DATABASE_ERROR,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::Unauthorized(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Store { context, source } = &self {
            error!(error = %source, "{context}");
        }
        let body = ErrorBody {
            error: self.code().to_owned(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(RouteError::from(ValidationError::EmptyText).code(), "validation_error");
        assert_eq!(RouteError::from(DecodeError("x".into())).code(), "validation_error");
        assert_eq!(RouteError::ChatNotFound.code(), "chat_not_found");
        assert_eq!(RouteError::Forbidden.code(), "forbidden");
        let store = || StoreError::Internal("boom".into());
        assert_eq!(RouteError::Members(store()).code(), "database_error");
        assert_eq!(RouteError::Save(store()).code(), "database_error");
    }

    #[test]
    fn store_cause_not_leaked_in_message() {
        let err = RouteError::Save(StoreError::Internal("disk I/O error at /var/db".into()));
        assert_eq!(err.to_string(), "Failed to save message");
    }

    #[test]
    fn api_error_statuses() {
        assert_eq!(ApiError::Unauthorized("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
        let err = ApiError::store("Failed to get chats")(StoreError::Internal("x".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "Failed to get chats");
        assert_eq!(ApiError::from(AuthError::Expired).code(), "unauthorized");
    }

    #[test]
    fn validation_message_passthrough() {
        let err = RouteError::from(ValidationError::TooLong { max: 4000 });
        assert_eq!(err.to_string(), "message too long (max 4000 characters)");
    }
}
