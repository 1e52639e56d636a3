//! Error types for completer implementations.

use thiserror::Error;

/// Result type for completer operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Error type for completer operations.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The completion was cancelled mid-stream.
    #[error("completion cancelled: {0}")]
    Cancelled(String),

    /// The backend rejected or failed the request.
    #[error("backend error: {0}")]
    Backend(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Create a backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// True when this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LlmError::Cancelled(_))
    }
}
