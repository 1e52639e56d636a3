//! Error types for outbound MCP clients.

use nanobot_types::RpcError;
use thiserror::Error;

/// Result type for MCP client operations.
pub type Result<T> = std::result::Result<T, McpError>;

/// Error type for MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The initialize handshake has not completed.
    #[error("client not initialized - call initialize() first")]
    NotInitialized,

    /// The client is closing or closed.
    #[error("client closed")]
    Closed,

    /// The transport to the upstream server broke.
    #[error("transport closed")]
    TransportClosed,

    /// The upstream answered with an error response.
    #[error("server error {}: {}", .0.code, .0.message)]
    Peer(RpcError),

    /// The request was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,

    /// No response arrived within the deadline.
    #[error("timeout waiting for response")]
    Timeout,

    /// The upstream does not advertise the required capability.
    #[error("capability not supported: {0}")]
    CapabilityUnsupported(&'static str),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error.
    #[error("transport error: {0}")]
    Transport(String),
}

impl McpError {
    /// Render this error as a JSON-RPC error object.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            McpError::Peer(err) => err.clone(),
            McpError::Cancelled => RpcError::request_cancelled("request cancelled"),
            McpError::TransportClosed | McpError::Closed => RpcError::transport_closed(),
            other => RpcError::internal(other.to_string()),
        }
    }
}
