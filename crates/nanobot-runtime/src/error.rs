//! Error types for the runtime.

use nanobot_mcp::McpError;
use nanobot_session::SessionError;
use nanobot_types::RpcError;
use thiserror::Error;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Error type for runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No mapping or template matched the resource URI.
    #[error("resource {0:?} not found")]
    ResourceNotFound(String),

    /// No tool mapping exists for the published name.
    #[error("tool {0:?} not found")]
    ToolNotFound(String),

    /// No prompt mapping exists for the published name.
    #[error("prompt {0:?} not found")]
    PromptNotFound(String),

    /// The reference names no configured server, agent, or flow.
    #[error("server {0:?} is not defined in the config")]
    ServerNotDefined(String),

    /// The URI template uses an unsupported operator or is malformed.
    #[error("invalid uri template: {0}")]
    InvalidTemplate(String),

    /// No agent engine has been wired into the runtime.
    #[error("agent engine unavailable")]
    AgentUnavailable,

    /// Config loading failed.
    #[error("config error: {0}")]
    Config(String),

    /// A pre-rendered JSON-RPC error from a nested engine (agent runs
    /// surface their own codes through here).
    #[error("{0}")]
    Rpc(RpcError),

    /// Upstream client error.
    #[error(transparent)]
    Mcp(#[from] McpError),

    /// Session error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Render this error as a JSON-RPC error object.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            RuntimeError::ResourceNotFound(uri) => {
                RpcError::new(RpcError::RESOURCE_NOT_FOUND, format!("resource {uri:?} not found"))
            }
            RuntimeError::ToolNotFound(name) => {
                RpcError::new(RpcError::TOOL_NOT_FOUND, format!("tool {name:?} not found"))
            }
            RuntimeError::PromptNotFound(name) => {
                RpcError::invalid_params(format!("prompt {name:?} not found"))
            }
            RuntimeError::ServerNotDefined(name) => {
                RpcError::invalid_params(format!("server {name:?} is not defined"))
            }
            RuntimeError::InvalidTemplate(detail) => {
                RpcError::invalid_params(format!("invalid uri template: {detail}"))
            }
            RuntimeError::Rpc(err) => err.clone(),
            RuntimeError::Mcp(err) => err.to_rpc_error(),
            RuntimeError::Session(err) => err.to_rpc_error(),
            other => RpcError::internal(other.to_string()),
        }
    }
}
