//! Error types for the agent loop.

use nanobot_types::RpcError;
use thiserror::Error;

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Error type for agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The run hit its turn limit before terminating.
    #[error("turn limit of {0} exceeded")]
    TurnLimitExceeded(u32),

    /// A planned tool call names no mapped tool.
    #[error("cannot map tool {0:?} to an MCP server")]
    ToolNotMapped(String),

    /// The named agent is not defined in the config.
    #[error("agent {0:?} is not defined in the config")]
    AgentNotDefined(String),

    /// The tool arguments did not parse as a JSON object.
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),

    /// Compaction produced an empty summary.
    #[error("compaction produced empty summary")]
    EmptySummary,

    /// Completer error.
    #[error(transparent)]
    Llm(#[from] nanobot_llm::LlmError),

    /// Runtime dispatch error.
    #[error(transparent)]
    Runtime(#[from] nanobot_runtime::RuntimeError),

    /// Session error.
    #[error(transparent)]
    Session(#[from] nanobot_session::SessionError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Render this error as a JSON-RPC error object.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            AgentError::TurnLimitExceeded(limit) => RpcError::new(
                RpcError::TURN_LIMIT_EXCEEDED,
                format!("turn limit of {limit} exceeded"),
            ),
            AgentError::ToolNotMapped(name) => {
                RpcError::new(RpcError::TOOL_NOT_FOUND, format!("tool {name:?} not mapped"))
            }
            AgentError::Runtime(err) => err.to_rpc_error(),
            AgentError::Session(err) => err.to_rpc_error(),
            other => RpcError::internal(other.to_string()),
        }
    }
}
