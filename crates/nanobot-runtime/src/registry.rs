//! The runtime registry: lazy per-session upstream clients and dispatch.
//!
//! The runtime owns, per session, a cache of `serverKey → McpClient`,
//! populated on first reference with a double-checked once-init per key.
//! References that resolve to an inline agent or flow produce a synthetic
//! client whose tool surface is generated rather than fetched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use nanobot_mcp::{CallOptions, McpClient, Transport};
use nanobot_session::Session;
use nanobot_types::{
    AGENT_TOOL_DESCRIPTION, AGENT_TOOL_PREFIX, CallResult, Config, FlowConfig, InitializeResult,
    McpServerDef, Message, ServerInfo, Tool, ToolMappings, ToolRef, ToolsCapability,
    chat_input_schema, config::CONFIG_SESSION_KEY,
};

use crate::data::{PROMPT_MAPPING_KEY, RESOURCE_MAPPING_KEY, RESOURCE_TEMPLATE_MAPPING_KEY, TOOL_MAPPING_KEY};
use crate::error::{Result, RuntimeError};

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator seams
// ─────────────────────────────────────────────────────────────────────────────

/// Opens a transport to a declared upstream server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `server` as declared by `def`, on behalf of `session`.
    async fn connect(&self, server: &str, def: &McpServerDef, session: &Session) -> Result<Transport>;
}

/// The agent completion engine, wired in by the composition root. Calling a
/// tool whose target is an agent enters this seam instead of an upstream.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Drive one agent run to completion and return its terminal output.
    async fn call_agent(
        &self,
        session: &Session,
        agent: &str,
        arguments: Option<Map<String, Value>>,
        opts: CallOptions,
    ) -> Result<CallResult>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// The per-process runtime. Client caches are per session; configuration is
/// read from each session's attributes.
pub struct Runtime {
    connector: Arc<dyn Connector>,
    agent_invoker: RwLock<Option<Arc<dyn AgentInvoker>>>,
    clients: Mutex<HashMap<String, Arc<OnceCell<McpClient>>>>,
}

impl Runtime {
    /// Create a runtime using `connector` for upstream transports.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            agent_invoker: RwLock::new(None),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Wire in the agent engine.
    pub fn set_agent_invoker(&self, invoker: Arc<dyn AgentInvoker>) {
        *self.agent_invoker.write().unwrap_or_else(|e| e.into_inner()) = Some(invoker);
    }

    fn invoker(&self) -> Result<Arc<dyn AgentInvoker>> {
        self.agent_invoker
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(RuntimeError::AgentUnavailable)
    }

    /// The config stored in the session.
    pub fn config(&self, session: &Session) -> Config {
        session.get::<Config>(CONFIG_SESSION_KEY).unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Client cache
    // ─────────────────────────────────────────────────────────────────────────

    /// Return (initializing if needed) the client for `name`. Inline agents
    /// and flows resolve to synthetic clients.
    pub async fn get_client(&self, session: &Session, name: &str) -> Result<RuntimeClient> {
        let config = self.config(session);

        if let Some(agent) = config.agents.get(name) {
            return Ok(RuntimeClient::Agent {
                name: name.to_string(),
                description: if agent.description.is_empty() {
                    AGENT_TOOL_DESCRIPTION.to_string()
                } else {
                    agent.description.clone()
                },
            });
        }
        if let Some(flow) = config.flows.get(name) {
            return Ok(RuntimeClient::Flow {
                name: name.to_string(),
                config: flow.clone(),
            });
        }

        let def = config
            .mcp_servers
            .get(name)
            .ok_or_else(|| RuntimeError::ServerNotDefined(name.to_string()))?
            .clone();

        let cell = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients
                .entry(client_key(session, name))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let client = cell
            .get_or_try_init(|| self.init_client(session, name, &def))
            .await?
            .clone();
        Ok(RuntimeClient::Mcp(client))
    }

    async fn init_client(&self, session: &Session, name: &str, def: &McpServerDef) -> Result<McpClient> {
        let transport = self.connector.connect(name, def, session).await?;
        let client = McpClient::connect(name, transport).await?;

        install_change_fanout(&client, session);
        client.initialize().await?;

        tracing::info!(session_id = %session.id(), server = %name, "upstream client ready");
        Ok(client)
    }

    /// Close and drop every cached client belonging to `session`.
    pub fn close_session_clients(&self, session: &Session) {
        let prefix = format!("{}/", session.id());
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.retain(|key, cell| {
            if !key.starts_with(&prefix) {
                return true;
            }
            if let Some(client) = cell.get() {
                client.close(false);
            }
            false
        });
    }

    /// Number of live cached clients for a session.
    pub fn cached_client_count(&self, session: &Session) -> usize {
        let prefix = format!("{}/", session.id());
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    /// Dispatch a tool call to its target: an upstream server, an agent run,
    /// or a flow.
    pub async fn call(
        &self,
        session: &Session,
        server: &str,
        tool: &str,
        arguments: Option<Map<String, Value>>,
        opts: CallOptions,
    ) -> Result<CallResult> {
        match self.get_client(session, server).await? {
            RuntimeClient::Mcp(client) => {
                let result = client.call_tool(tool, arguments, opts).await?;
                let is_error = result.is_error();
                Ok(CallResult {
                    content: result.content,
                    is_error,
                    ..Default::default()
                })
            }
            RuntimeClient::Agent { name, .. } => {
                self.invoker()?
                    .call_agent(session, &name, arguments, opts)
                    .await
            }
            RuntimeClient::Flow { name, config } => {
                self.run_flow(session, &name, &config, arguments).await
            }
        }
    }

    /// Run a flow: each step dispatches in order, the prior step's content
    /// carried forward; the last step's output is the result.
    async fn run_flow(
        &self,
        session: &Session,
        name: &str,
        flow: &FlowConfig,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallResult> {
        let mut result = CallResult::default();
        let mut args = arguments;

        for step in &flow.steps {
            let step_ref = ToolRef::parse(step);
            tracing::debug!(session_id = %session.id(), flow = %name, step = %step, "running flow step");

            result = Box::pin(self.call(
                session,
                &step_ref.server,
                &step_ref.tool,
                args.take(),
                CallOptions::default(),
            ))
            .await?;

            if result.is_error {
                return Ok(result);
            }

            // Feed the step's text output forward as the next step's prompt.
            let text: Vec<&str> = result.content.iter().filter_map(|c| c.as_text()).collect();
            let mut next = Map::new();
            next.insert("prompt".to_string(), Value::String(text.join("\n")));
            args = Some(next);
        }

        Ok(result)
    }

    /// `prompts/get` against the named upstream.
    pub async fn get_prompt(
        &self,
        session: &Session,
        server: &str,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<nanobot_types::GetPromptResult> {
        match self.get_client(session, server).await? {
            RuntimeClient::Mcp(client) => Ok(client.get_prompt(name, arguments).await?),
            _ => Err(RuntimeError::PromptNotFound(name.to_string())),
        }
    }

    /// `resources/read` against the named upstream.
    pub async fn read_resource(
        &self,
        session: &Session,
        server: &str,
        uri: &str,
    ) -> Result<nanobot_types::ReadResourceResult> {
        match self.get_client(session, server).await? {
            RuntimeClient::Mcp(client) => Ok(client.read_resource(uri).await?),
            _ => Err(RuntimeError::ResourceNotFound(uri.to_string())),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mapping construction
    // ─────────────────────────────────────────────────────────────────────────

    /// Build tool mappings for refs of the form `[alias:]server[/tool]`.
    ///
    /// Duplicate published names tie-break with the last ref winning, except
    /// that inline agent/flow tools are never displaced by remote tools. A
    /// ref whose upstream fails to answer contributes nothing; the rest of
    /// the list still maps.
    pub async fn build_tool_mappings(&self, session: &Session, refs: &[String]) -> Result<ToolMappings> {
        let mut mappings = ToolMappings::new();
        let mut inline_names: Vec<String> = Vec::new();

        for raw in refs {
            let tool_ref = ToolRef::parse(raw);
            if tool_ref.server.is_empty() {
                continue;
            }

            let client = match self.get_client(session, &tool_ref.server).await {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!(
                        session_id = %session.id(),
                        server = %tool_ref.server,
                        error = %e,
                        "skipping ref while building tool mappings"
                    );
                    continue;
                }
            };

            match &client {
                RuntimeClient::Agent { name, description } => {
                    let target_name = format!("{AGENT_TOOL_PREFIX}{name}");
                    let published = tool_ref.published_name(&target_name);
                    inline_names.push(published.clone());
                    mappings.insert(
                        published.clone(),
                        nanobot_types::TargetMapping {
                            mcp_server: name.clone(),
                            target_name,
                            target: Tool {
                                name: published,
                                description: Some(description.clone()),
                                input_schema: Some(chat_input_schema()),
                            },
                        },
                    );
                }
                RuntimeClient::Flow { name, config } => {
                    let published = tool_ref.published_name(name);
                    inline_names.push(published.clone());
                    mappings.insert(
                        published.clone(),
                        nanobot_types::TargetMapping {
                            mcp_server: name.clone(),
                            target_name: name.clone(),
                            target: Tool {
                                name: published,
                                description: if config.description.is_empty() {
                                    None
                                } else {
                                    Some(config.description.clone())
                                },
                                input_schema: Some(chat_input_schema()),
                            },
                        },
                    );
                }
                RuntimeClient::Mcp(client) => {
                    let tools = match client.list_tools().await {
                        Ok(tools) => tools,
                        Err(e) => {
                            tracing::error!(
                                session_id = %session.id(),
                                server = %tool_ref.server,
                                error = %e,
                                "skipping ref after tools/list failure"
                            );
                            continue;
                        }
                    };

                    for mut tool in tools {
                        if !tool_ref.tool.is_empty() && tool.name != tool_ref.tool {
                            continue;
                        }
                        let published = tool_ref.published_name(&tool.name);
                        if inline_names.contains(&published) {
                            continue;
                        }
                        let target_name = std::mem::take(&mut tool.name);
                        tool.name = published.clone();
                        mappings.insert(
                            published,
                            nanobot_types::TargetMapping {
                                mcp_server: tool_ref.server.clone(),
                                target_name,
                                target: tool,
                            },
                        );
                    }
                }
            }
        }

        Ok(mappings)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Runtime")
            .field("cached_clients", &clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn client_key(session: &Session, server: &str) -> String {
    format!("{}/{}", session.id(), server)
}

/// Register the upstream change fan-out: list-changed notifications drop the
/// matching mapping cache and are re-emitted to the client once; everything
/// else (resource updates, unrouted progress) forwards as-is, with the
/// session's filters deciding delivery.
fn install_change_fanout(client: &McpClient, session: &Session) {
    let session = session.clone();
    client.on_notification(Arc::new(move |msg: Message| {
        match msg.method.as_deref() {
            Some("notifications/tools/list_changed") => {
                session.delete(TOOL_MAPPING_KEY);
            }
            Some("notifications/prompts/list_changed") => {
                session.delete(PROMPT_MAPPING_KEY);
            }
            Some("notifications/resources/list_changed") => {
                session.delete(RESOURCE_MAPPING_KEY);
                session.delete(RESOURCE_TEMPLATE_MAPPING_KEY);
            }
            _ => {}
        }

        let session = session.clone();
        tokio::spawn(async move {
            match session.accept(msg) {
                Ok(Some(msg)) => {
                    let _ = session.send(msg).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(session_id = %session.id(), error = %e, "dropping upstream notification");
                }
            }
        });
    }));
}

// ─────────────────────────────────────────────────────────────────────────────
// RuntimeClient
// ─────────────────────────────────────────────────────────────────────────────

/// What a reference resolves to: a live upstream client, or a synthetic
/// client over an inline agent or flow.
#[derive(Debug, Clone)]
pub enum RuntimeClient {
    /// A connected upstream MCP server.
    Mcp(McpClient),
    /// An inline agent; its tool surface is a single `chat-with-<name>`.
    Agent { name: String, description: String },
    /// An inline flow.
    Flow { name: String, config: FlowConfig },
}

impl RuntimeClient {
    /// The tool list this client exposes.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        match self {
            RuntimeClient::Mcp(client) => Ok(client.list_tools().await?),
            RuntimeClient::Agent { name, description } => Ok(vec![Tool {
                name: format!("{AGENT_TOOL_PREFIX}{name}"),
                description: Some(description.clone()),
                input_schema: Some(chat_input_schema()),
            }]),
            RuntimeClient::Flow { name, config } => Ok(vec![Tool {
                name: name.clone(),
                description: if config.description.is_empty() {
                    None
                } else {
                    Some(config.description.clone())
                },
                input_schema: Some(chat_input_schema()),
            }]),
        }
    }

    /// The initialize result: the upstream's own for real clients, a
    /// synthesized one for inline targets.
    pub fn init_result(&self) -> Option<InitializeResult> {
        match self {
            RuntimeClient::Mcp(client) => client.init_result(),
            RuntimeClient::Agent { name, .. } | RuntimeClient::Flow { name, .. } => {
                Some(InitializeResult {
                    protocol_version: nanobot_types::MCP_PROTOCOL_VERSION.to_string(),
                    capabilities: nanobot_types::ServerCapabilities {
                        tools: Some(ToolsCapability::default()),
                        ..Default::default()
                    },
                    server_info: ServerInfo {
                        name: name.clone(),
                        version: String::new(),
                    },
                    instructions: None,
                })
            }
        }
    }

    /// The underlying MCP client, when this is a real upstream.
    pub fn as_mcp(&self) -> Option<&McpClient> {
        match self {
            RuntimeClient::Mcp(client) => Some(client),
            _ => None,
        }
    }
}

// Re-exported so callers dispatching through the runtime build options
// without importing nanobot-mcp directly.
pub use nanobot_mcp::CallOptions as RuntimeCallOptions;
