//! The nanobot runtime: per-session upstream registry and mapping layer.
//!
//! [`Runtime`] lazily constructs and caches MCP clients per session and
//! dispatches tool calls, prompt gets, and resource reads. [`SessionData`]
//! keeps the published-surface mappings cached in session attributes and
//! invalidates them when the `{config, env}` hash changes.

pub mod data;
pub mod error;
pub mod registry;
pub mod template;

pub use data::{
    AGENTS_SESSION_KEY, ConfigFactory, PROMPT_MAPPING_KEY, RESOURCE_MAPPING_KEY,
    RESOURCE_TEMPLATE_MAPPING_CACHE_KEY, RESOURCE_TEMPLATE_MAPPING_KEY, RequestContext,
    ResourceTemplateMappings, SessionData, TOOL_MAPPING_KEY, TemplateMatch, config_hash,
};
pub use error::{Result, RuntimeError};
pub use registry::{AgentInvoker, Connector, Runtime, RuntimeCallOptions, RuntimeClient};
