//! Shared types for the nanobot MCP aggregator.
//!
//! This crate holds the wire-level building blocks used by every other
//! member of the workspace:
//!
//! - [`jsonrpc`]: the JSON-RPC 2.0 envelope and error codes
//! - [`protocol`]: MCP method payloads (tools, prompts, resources, progress,
//!   elicitation)
//! - [`config`]: the declarative nanobot configuration and tool references
//! - [`completion`]: the completion request/response model shared by the
//!   agent loop and the Completer contract

pub mod completion;
pub mod config;
pub mod jsonrpc;
pub mod protocol;

pub use completion::{
    AGENT_TOOL_DESCRIPTION, AGENT_TOOL_PREFIX, COMPACTION_SUMMARY_META_KEY,
    COMPLETION_PROGRESS_META_KEY, CallResult, ChatMessage, CompletionItem, CompletionProgress,
    CompletionRequest, CompletionResponse, OutputSchema, Reasoning, SKIP_TRUNCATION_META_KEY,
    SummaryText, TOOL_CONFIRM_TYPE, ToolCall, ToolCallResult, ToolUseDefinition,
    chat_input_schema,
};
pub use config::{
    AgentConfig, AgentDisplay, Config, EnvDef, FlowConfig, Hooks, McpServerDef, PromptConfig,
    PromptMappings, Publish, ResourceMappings, SessionInit, TargetMapping, ToolMappings, ToolRef,
};
pub use jsonrpc::{JSONRPC_VERSION, Message, RequestId, RpcError};
pub use protocol::{
    CallToolParams, CallToolResult, CancelledParams, ClientCapabilities, ClientInfo, Content,
    ELICITATION_CREATE_METHOD, ElicitParams, ElicitResult, GetPromptParams, GetPromptResult,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, MCP_PROTOCOL_VERSION, ProgressParams, Prompt,
    PromptArgument, PromptMessage, PromptsCapability, ReadResourceParams, ReadResourceResult,
    Resource, ResourceContents, ResourceTemplate, ResourceUpdatedParams, ResourcesCapability,
    ServerCapabilities, ServerInfo, SetLevelParams, SubscribeParams, Tool, ToolsCapability,
};
