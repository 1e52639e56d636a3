//! Declarative configuration for a nanobot.
//!
//! The [`Config`] describes the published MCP surface, inline agents, flows,
//! prompts, required environment variables, and upstream server declarations.
//! Map-typed sections use `BTreeMap` so that serialization (and therefore the
//! per-session config hash) is deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{Prompt, PromptArgument, Tool};

// ─────────────────────────────────────────────────────────────────────────────
// Session attribute keys
// ─────────────────────────────────────────────────────────────────────────────

/// Session key holding the loaded [`Config`].
pub const CONFIG_SESSION_KEY: &str = "config";
/// Session key holding the sha256 over `{config, env}`.
pub const CONFIG_HASH_SESSION_KEY: &str = "configHash";
/// Session key holding the selected entrypoint agent.
pub const CURRENT_AGENT_SESSION_KEY: &str = "currentAgent";
/// Session key holding transport-derived init metadata.
pub const SESSION_INIT_SESSION_KEY: &str = "sessionInit";
/// Session key holding the authenticated account ID.
pub const ACCOUNT_ID_SESSION_KEY: &str = "accountID";
/// Session key holding the set of subscribed resource URIs.
pub const RESOURCE_SUBSCRIPTIONS_SESSION_KEY: &str = "resourceSubscriptions";
/// Session key holding the request-derived public URL.
pub const PUBLIC_URL_SESSION_KEY: &str = "publicURL";

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// The merged declarative description of a nanobot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, EnvDef>,
    #[serde(skip_serializing_if = "Publish::is_empty")]
    pub publish: Publish,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub agents: BTreeMap<String, AgentConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub mcp_servers: BTreeMap<String, McpServerDef>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub flows: BTreeMap<String, FlowConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub prompts: BTreeMap<String, PromptConfig>,
    #[serde(skip_serializing_if = "Hooks::is_empty")]
    pub hooks: Hooks,
}

impl Config {
    /// Validate internal references: every agent tool/server reference must
    /// name a defined target, and non-server references may not contain
    /// slashes.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errs = Vec::new();

        if self.publish.entrypoint.is_empty() && self.agents.len() > 1 {
            errs.push("publish must set an entrypoint when there are multiple agents".to_string());
        }

        for (name, agent) in &self.agents {
            for server in &agent.mcp_servers {
                if !self.mcp_servers.contains_key(server) {
                    errs.push(format!(
                        "agent {name:?} references MCP server {server:?} that is not defined"
                    ));
                }
            }
            for agent_ref in &agent.agents {
                if agent_ref.contains('/') {
                    errs.push(format!(
                        "invalid agent reference {agent_ref:?}: slashes are not allowed"
                    ));
                } else if !self.agents.contains_key(agent_ref) {
                    errs.push(format!(
                        "agent {name:?} references agent {agent_ref:?} that is not defined"
                    ));
                }
            }
            for tool_ref in &agent.tools {
                let parsed = ToolRef::parse(tool_ref);
                if !self.mcp_servers.contains_key(&parsed.server)
                    && !self.agents.contains_key(&parsed.server)
                    && !self.flows.contains_key(&parsed.server)
                {
                    errs.push(format!(
                        "agent {name:?} references {:?} which names no server, agent, or flow",
                        parsed.server
                    ));
                }
            }
        }

        for entry in &self.publish.entrypoint {
            if !self.agents.contains_key(entry) && !self.mcp_servers.contains_key(entry) {
                errs.push(format!(
                    "entrypoint {entry:?} names no defined agent or MCP server"
                ));
            }
        }

        if errs.is_empty() { Ok(()) } else { Err(errs) }
    }

    /// A copy safe to render for display: sensitive env defaults and server
    /// header values are masked.
    pub fn redacted(&self) -> Config {
        let mut out = self.clone();
        for def in out.env.values_mut() {
            if def.sensitive.unwrap_or(true) && !def.default.is_empty() {
                def.default = mask(&def.default);
            }
        }
        for server in out.mcp_servers.values_mut() {
            for value in server.headers.values_mut() {
                *value = mask(value);
            }
            for value in server.env.values_mut() {
                *value = mask(value);
            }
        }
        out
    }
}

fn mask(value: &str) -> String {
    let keep = (value.chars().count() / 2).min(10);
    let kept: String = value.chars().take(keep).collect();
    format!("{kept}...")
}

/// A required or optional environment variable declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvDef {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub default: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitive: Option<bool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub use_bearer_token: bool,
}

/// The published MCP surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Publish {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instructions: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resource_templates: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
}

impl Publish {
    /// True when nothing is published.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.version.is_empty()
            && self.instructions.is_empty()
            && self.tools.is_empty()
            && self.prompts.is_empty()
            && self.resources.is_empty()
            && self.resource_templates.is_empty()
            && self.mcp_servers.is_empty()
            && self.entrypoint.is_empty()
    }

    /// True when this nanobot merely fronts a single MCP server: exactly one
    /// published server and no other surface. In that case `initialize`
    /// forwards the upstream's result verbatim.
    pub fn is_single_server_proxy(&self) -> bool {
        self.mcp_servers.len() == 1
            && self.entrypoint.is_empty()
            && self.tools.is_empty()
            && self.prompts.is_empty()
            && self.resources.is_empty()
            && self.resource_templates.is_empty()
            && self.instructions.is_empty()
    }
}

/// An upstream MCP server declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct McpServerDef {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// An inline agent definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instructions: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool_choice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSchemaDef>,
}

/// A declared structured-output schema for an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputSchemaDef {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub strict: bool,
}

/// An inline flow: an ordered sequence of tool steps run as one call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
}

/// An inline prompt definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub template: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub input: BTreeMap<String, FieldDef>,
}

impl PromptConfig {
    /// Render this inline definition as a published [`Prompt`].
    pub fn to_prompt(&self, name: impl Into<String>) -> Prompt {
        Prompt {
            name: name.into(),
            description: if self.description.is_empty() {
                None
            } else {
                Some(self.description.clone())
            },
            arguments: self
                .input
                .iter()
                .map(|(field, def)| PromptArgument {
                    name: field.clone(),
                    description: if def.description.is_empty() {
                        None
                    } else {
                        Some(def.description.clone())
                    },
                    required: def.required.unwrap_or(true),
                })
                .collect(),
        }
    }
}

/// One input field of an inline prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldDef {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

/// Pluggable interception points, each naming an MCP tool as `server/tool`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hooks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl Hooks {
    /// True when no hook is configured.
    pub fn is_empty(&self) -> bool {
        self.config.is_none()
            && self.session.is_none()
            && self.request.is_none()
            && self.response.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool references and mappings
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed reference of the form `[alias:]server[/tool]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolRef {
    pub server: String,
    pub tool: String,
    pub alias: String,
}

impl ToolRef {
    /// Parse `[alias:]server[/tool]`.
    pub fn parse(text: &str) -> Self {
        let (alias, rest) = match text.split_once(':') {
            Some((alias, rest)) => (alias.to_string(), rest),
            None => (String::new(), text),
        };
        let (server, tool) = match rest.split_once('/') {
            Some((server, tool)) => (server.to_string(), tool.to_string()),
            None => (rest.to_string(), String::new()),
        };
        Self { server, tool, alias }
    }

    /// The name the client sees: the alias wins, then the explicit tool, then
    /// the discovered name, then the server key itself.
    pub fn published_name(&self, name: &str) -> String {
        if !self.alias.is_empty() {
            return self.alias.clone();
        }
        if !self.tool.is_empty() {
            return self.tool.clone();
        }
        if name.is_empty() {
            return self.server.clone();
        }
        name.to_string()
    }
}

impl std::fmt::Display for ToolRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.alias.is_empty() {
            write!(f, "{}:", self.alias)?;
        }
        write!(f, "{}", self.server)?;
        if !self.tool.is_empty() {
            write!(f, "/{}", self.tool)?;
        }
        Ok(())
    }
}

/// A published-name target: the upstream server, the name there, and the
/// descriptor shown to clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetMapping<T> {
    pub mcp_server: String,
    pub target_name: String,
    pub target: T,
}

/// Published tool name → target. Sorted iteration comes with the map.
pub type ToolMappings = BTreeMap<String, TargetMapping<Tool>>;
/// Published prompt name → target.
pub type PromptMappings = BTreeMap<String, TargetMapping<Prompt>>;
/// Published resource URI → target.
pub type ResourceMappings = BTreeMap<String, TargetMapping<crate::protocol::Resource>>;

/// Transport-derived session initialization metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionInit {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ui: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub chat: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub workspace: String,
}

/// An agent entry as shown in client pickers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDisplay {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub current: bool,
}
