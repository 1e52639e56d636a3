//! Error types for session operations.

use nanobot_types::{RequestId, RpcError};
use thiserror::Error;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A request with the same ID is already in flight.
    #[error("duplicate request id: {0}")]
    DuplicateRequestId(RequestId),

    /// The exchange or session was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The exchange deadline passed without a response.
    #[error("timeout waiting for response")]
    Timeout,

    /// The peer answered with an error response.
    #[error("peer error: {0}")]
    Peer(RpcError),

    /// The outbound transport is closed.
    #[error("transport closed")]
    TransportClosed,

    /// Linking the parent would create a cycle.
    #[error("session parent link would create a cycle")]
    ParentCycle,

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Render this error as a JSON-RPC error object.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            SessionError::DuplicateRequestId(id) => {
                RpcError::new(RpcError::INVALID_REQUEST, format!("duplicate request id: {id}"))
            }
            SessionError::Cancelled(reason) => RpcError::request_cancelled(reason.clone()),
            SessionError::Timeout => RpcError::internal("timeout waiting for response"),
            SessionError::Peer(err) => err.clone(),
            SessionError::TransportClosed => RpcError::transport_closed(),
            SessionError::ParentCycle => RpcError::internal("session parent cycle"),
            SessionError::Json(err) => RpcError::internal(err.to_string()),
        }
    }
}
