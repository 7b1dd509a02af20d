use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

use skytalk_shared::RelayError;
use skytalk_store::StoreError;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("File not found: {0}")]
    FileNotFound(Uuid),

    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: usize, max: usize },

    #[error("File storage error: {0}")]
    FileStorage(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(detail) => ServerError::Conflict(detail),
            StoreError::NotFound => ServerError::Relay(RelayError::NotFound("User")),
            other => ServerError::Relay(RelayError::StoreUnavailable(other.to_string())),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Auth(AuthError::DirectoryUnavailable(detail)) => {
                tracing::error!(error = %detail, "User directory unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "User directory unavailable".to_string(),
                )
            }
            ServerError::Auth(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Relay(err) => {
                let status = match err {
                    RelayError::NotFriends | RelayError::Forbidden => StatusCode::FORBIDDEN,
                    RelayError::NotFound(_) => StatusCode::NOT_FOUND,
                    RelayError::Validation(_) => StatusCode::BAD_REQUEST,
                    RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                    RelayError::StoreUnavailable(detail) => {
                        tracing::error!(error = %detail, "Store failure");
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    RelayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.client_message())
            }
            ServerError::FileNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::FileTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ServerError::FileStorage(detail) => {
                tracing::error!(error = %detail, "File storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "File storage error".to_string(),
                )
            }
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = if matches!(self, ServerError::Auth(AuthError::ExpiredCredential)) {
            serde_json::json!({ "error": message, "expired": true })
        } else {
            serde_json::json!({ "error": message })
        };

        (status, axum::Json(body)).into_response()
    }
}
