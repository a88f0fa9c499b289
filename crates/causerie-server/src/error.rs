//! Error plumbing between the store, the engine services, and HTTP.
//!
//! Engine operations return [`ChatError`] values; the gateway turns them into
//! `{success:false, error, code}` acks and the HTTP surface turns them into
//! status-coded JSON bodies.  Nothing in here panics.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use causerie_shared::ChatError;
use causerie_store::StoreError;

/// Map a store failure onto the operation-level taxonomy.  Lost races are
/// reported by the store as `Ok(false)` guard results, so only the absent
/// record case carries over; everything else is an infrastructure failure.
pub fn chat_err(e: StoreError) -> ChatError {
    match e {
        StoreError::NotFound => ChatError::NotFound,
        other => ChatError::Internal(other.to_string()),
    }
}

/// HTTP wrapper so handlers can `?` a [`ChatError`] straight into a response.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(chat_err(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::NotFound => StatusCode::NOT_FOUND,
            ChatError::PermissionDenied | ChatError::NotMember | ChatError::InvitesDisabled => {
                StatusCode::FORBIDDEN
            }
            ChatError::Validation(_) | ChatError::InvalidToken => StatusCode::BAD_REQUEST,
            ChatError::Expired => StatusCode::GONE,
            ChatError::RoomFull | ChatError::Conflict | ChatError::NoUnusedPreKeys => {
                StatusCode::CONFLICT
            }
            ChatError::Auth => StatusCode::UNAUTHORIZED,
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &self.0 {
            // Internal detail stays in the logs, not on the wire.
            ChatError::Internal(detail) => {
                tracing::error!(error = %detail, "internal error in HTTP handler");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "error": message,
            "code": self.0.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}
