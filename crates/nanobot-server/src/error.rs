//! Error types for the server endpoint.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Error type for HTTP-level server operations. JSON-RPC-level failures are
/// answered in-band as error responses, never through this type.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The referenced session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The request body or headers were malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ServerError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let message = self.to_string();
        match &self {
            ServerError::Internal(_) => {
                tracing::error!(status = %status, code, error = %message, "server error");
            }
            _ => {
                tracing::warn!(status = %status, code, error = %message, "client error");
            }
        }

        (
            status,
            Json(ErrorBody {
                code: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}
