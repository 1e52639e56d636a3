//! The aggregator's JSON-RPC method dispatch.
//!
//! [`McpServer::on_message`] synchronizes session data, registers the
//! request in the session's in-flight table, and routes by method. Errors
//! become in-band JSON-RPC error responses; unknown methods fail with
//! MethodNotFound.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use nanobot_agent::REQUEST_ID_META_KEY;
use nanobot_mcp::CallOptions;
use nanobot_runtime::{ConfigFactory, RequestContext, SessionData};
use nanobot_session::{Session, SessionError};
use nanobot_types::{
    CallToolParams, CallToolResult, CancelledParams, Config, GetPromptParams,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, Message, PromptsCapability, ReadResourceParams,
    ResourcesCapability, RpcError, ServerCapabilities, ServerInfo, SessionInit, SetLevelParams,
    SubscribeParams, Tool, ToolsCapability,
    config::{PUBLIC_URL_SESSION_KEY, SESSION_INIT_SESSION_KEY},
};

use crate::audit::{AuditLog, Collector};

/// Env key carrying the transport bearer token, consulted by
/// `useBearerToken` env definitions.
pub const BEARER_TOKEN_ENV_KEY: &str = "http:bearer-token";

/// Session key recording the client's self-reported name from `initialize`.
const CLIENT_NAME_SESSION_KEY: &str = "clientName";

/// Server behavior switches.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Rebuild the tool mappings on every `tools/list` instead of serving
    /// the cached copy.
    pub force_fetch_tool_list: bool,
}

/// The aggregating MCP endpoint over one runtime.
pub struct McpServer {
    data: SessionData,
    config_factory: ConfigFactory,
    audit: Option<Arc<Collector>>,
    options: ServerOptions,
}

impl McpServer {
    /// Create a server over the session data layer.
    pub fn new(data: SessionData, config_factory: ConfigFactory) -> Self {
        Self {
            data,
            config_factory,
            audit: None,
            options: ServerOptions::default(),
        }
    }

    /// Attach an audit collector.
    pub fn with_audit(mut self, audit: Arc<Collector>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Apply behavior switches.
    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// The data layer this server dispatches through.
    pub fn data(&self) -> &SessionData {
        &self.data
    }

    /// Handle one inbound client message end to end: sync session data,
    /// register the request, dispatch, and reply. Never returns an error;
    /// failures are answered in-band.
    pub async fn on_message(&self, session: &Session, ctx: &RequestContext, msg: Message) {
        if let Err(e) = self.data.sync(session, ctx, &self.config_factory) {
            self.send_error(session, &msg, e.to_rpc_error()).await;
            return;
        }

        self.record_audit(session, &msg);

        let result = session
            .run(&msg, |token, msg| {
                let this = self;
                let session = session.clone();
                async move { this.dispatch(&session, token, msg).await }
            })
            .await;

        match result {
            Ok(()) => {}
            Err(SessionError::DuplicateRequestId(id)) => {
                self.send_error(
                    session,
                    &msg,
                    RpcError::new(RpcError::INVALID_REQUEST, format!("duplicate request id: {id}")),
                )
                .await;
            }
            Err(e) => {
                self.send_error(session, &msg, e.to_rpc_error()).await;
            }
        }
    }

    async fn send_error(&self, session: &Session, msg: &Message, error: RpcError) {
        if let Some(id) = msg.id.clone() {
            let _ = session.reply_error(id, error).await;
        } else {
            tracing::warn!(
                session_id = %session.id(),
                method = msg.method.as_deref().unwrap_or(""),
                error = %error,
                "error handling notification"
            );
        }
    }

    fn record_audit(&self, session: &Session, msg: &Message) {
        let Some(audit) = &self.audit else { return };
        let Some(method) = msg.method.clone() else { return };

        let call_identifier = msg
            .params
            .as_ref()
            .and_then(|p| p.get("name").or_else(|| p.get("uri")))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        audit.collect(AuditLog {
            call_type: method,
            call_identifier,
            client_name: session
                .get::<String>(CLIENT_NAME_SESSION_KEY)
                .unwrap_or_default(),
            session_id: session.id().to_string(),
            created: Some(chrono::Utc::now()),
            metadata: None,
        });
    }

    async fn dispatch(
        &self,
        session: &Session,
        token: CancellationToken,
        msg: Message,
    ) -> Result<(), SessionError> {
        let method = msg.method.clone().unwrap_or_default();
        let result = match method.as_str() {
            "initialize" => self.handle_initialize(session, &msg).await,
            "notifications/initialized" => Ok(None),
            "ping" => Ok(Some(json!({}))),
            "logging/setLevel" => self.handle_set_log_level(session, &msg).await,
            "tools/list" => self.handle_list_tools(session).await,
            "tools/call" => self.handle_call_tool(session, token, &msg).await,
            "prompts/list" => self.handle_list_prompts(session).await,
            "prompts/get" => self.handle_get_prompt(session, &msg).await,
            "resources/list" => self.handle_list_resources(session).await,
            "resources/templates/list" => self.handle_list_resource_templates(session).await,
            "resources/read" => self.handle_read_resource(session, &msg).await,
            "resources/subscribe" => self.handle_subscribe(session, &msg, true).await,
            "resources/unsubscribe" => self.handle_subscribe(session, &msg, false).await,
            "notifications/cancelled" => self.handle_cancelled(session, &msg),
            other => Err(RpcError::method_not_found(other)),
        };

        match (msg.id, result) {
            (Some(id), Ok(Some(value))) => session.reply(id, value).await,
            (Some(id), Err(error)) => session.reply_error(id, error).await,
            (None, Err(error)) => {
                tracing::warn!(
                    session_id = %session.id(),
                    method = %method,
                    error = %error,
                    "notification handler failed"
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // initialize
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_initialize(
        &self,
        session: &Session,
        msg: &Message,
    ) -> Result<Option<Value>, RpcError> {
        let payload: InitializeParams = msg.parse_params()?;
        let config = self.data.runtime().config(session);

        session.set(CLIENT_NAME_SESSION_KEY, &payload.client_info.name);
        self.run_session_init_hook(session, &config).await?;
        reconcile_env(session, &config)?;
        self.data.refresh(session, false);

        if config.publish.is_single_server_proxy() {
            // One published upstream and nothing else: forward its
            // InitializeResult verbatim.
            let upstream = &config.publish.mcp_servers[0];
            let client = self
                .data
                .runtime()
                .get_client(session, upstream)
                .await
                .map_err(|e| e.to_rpc_error())?;
            let init = client
                .init_result()
                .ok_or_else(|| RpcError::internal("upstream reported no initialize result"))?;
            return Ok(Some(serde_json::to_value(init).map_err(to_internal)?));
        }

        let result = InitializeResult {
            protocol_version: payload.protocol_version,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability::default()),
                prompts: Some(PromptsCapability::default()),
                resources: Some(ResourcesCapability {
                    subscribe: Some(true),
                    list_changed: Some(true),
                }),
                logging: Some(json!({})),
                experimental: None,
            },
            server_info: ServerInfo {
                name: config.publish.name.clone(),
                version: config.publish.version.clone(),
            },
            instructions: if config.publish.instructions.is_empty() {
                None
            } else {
                Some(config.publish.instructions.clone())
            },
        };
        Ok(Some(serde_json::to_value(result).map_err(to_internal)?))
    }

    /// Seed the session-init record and run the configured session hook, if
    /// any, letting it rewrite the record.
    async fn run_session_init_hook(
        &self,
        session: &Session,
        config: &Config,
    ) -> Result<(), RpcError> {
        let mut init: SessionInit = session.get(SESSION_INIT_SESSION_KEY).unwrap_or_default();
        init.session_id = session.id().to_string();
        if let Some(url) = session.get::<String>(PUBLIC_URL_SESSION_KEY) {
            init.ui = url.ends_with("/mcp/ui");
            init.chat = url.ends_with("/mcp/chat");
            init.url = url;
        }

        if let Some(hook) = &config.hooks.session {
            let hook_ref = nanobot_types::ToolRef::parse(hook);
            let mut args = Map::new();
            args.insert(
                "session".to_string(),
                serde_json::to_value(&init).map_err(to_internal)?,
            );
            let result = self
                .data
                .runtime()
                .call(session, &hook_ref.server, &hook_ref.tool, Some(args), CallOptions::default())
                .await
                .map_err(|e| {
                    RpcError::internal(format!("failed to invoke session hook: {e}"))
                })?;
            if let Some(text) = result.content.first().and_then(|c| c.as_text()) {
                if let Ok(rewritten) = serde_json::from_str::<SessionInit>(text) {
                    init = rewritten;
                }
            }
        }

        session.set(SESSION_INIT_SESSION_KEY, &init);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // tools
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_list_tools(&self, session: &Session) -> Result<Option<Value>, RpcError> {
        let mappings = self
            .data
            .tool_mappings(session, self.options.force_fetch_tool_list)
            .await
            .map_err(|e| e.to_rpc_error())?;

        let tools: Vec<Tool> = mappings.values().map(|m| m.target.clone()).collect();
        Ok(Some(
            serde_json::to_value(ListToolsResult { tools }).map_err(to_internal)?,
        ))
    }

    async fn handle_call_tool(
        &self,
        session: &Session,
        token: CancellationToken,
        msg: &Message,
    ) -> Result<Option<Value>, RpcError> {
        let payload: CallToolParams = msg.parse_params()?;

        let mappings = self
            .data
            .tool_mappings(session, false)
            .await
            .map_err(|e| e.to_rpc_error())?;
        let mapping = match mappings.get(&payload.name) {
            Some(mapping) => mapping.clone(),
            None => {
                // One refresh, one retry; a second miss is terminal.
                self.data.refresh(session, false);
                let mappings = self
                    .data
                    .tool_mappings(session, false)
                    .await
                    .map_err(|e| e.to_rpc_error())?;
                mappings
                    .get(&payload.name)
                    .cloned()
                    .ok_or_else(|| {
                        RpcError::new(
                            RpcError::TOOL_NOT_FOUND,
                            format!("tool {:?} not found", payload.name),
                        )
                    })?
            }
        };

        let mut meta = payload.meta.clone().unwrap_or_default();
        if let Some(id) = &msg.id {
            meta.insert(
                REQUEST_ID_META_KEY.to_string(),
                serde_json::to_value(id).map_err(to_internal)?,
            );
        }

        let result = self
            .data
            .runtime()
            .call(
                session,
                &mapping.mcp_server,
                &mapping.target_name,
                payload.arguments,
                CallOptions {
                    progress_token: msg.progress_token(),
                    meta: Some(meta),
                    abort: Some(token),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| e.to_rpc_error())?;

        let reply = CallToolResult {
            content: result.content,
            structured_content: None,
            is_error: Some(result.is_error),
        };
        Ok(Some(serde_json::to_value(reply).map_err(to_internal)?))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // prompts
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_list_prompts(&self, session: &Session) -> Result<Option<Value>, RpcError> {
        self.data.refresh(session, false);
        let mappings = self
            .data
            .prompt_mappings(session)
            .await
            .map_err(|e| e.to_rpc_error())?;

        let prompts = mappings.values().map(|m| m.target.clone()).collect();
        Ok(Some(
            serde_json::to_value(ListPromptsResult { prompts }).map_err(to_internal)?,
        ))
    }

    async fn handle_get_prompt(
        &self,
        session: &Session,
        msg: &Message,
    ) -> Result<Option<Value>, RpcError> {
        let payload: GetPromptParams = msg.parse_params()?;
        let mappings = self
            .data
            .prompt_mappings(session)
            .await
            .map_err(|e| e.to_rpc_error())?;
        let mapping = mappings.get(&payload.name).ok_or_else(|| {
            RpcError::invalid_params(format!("prompt {:?} not found", payload.name))
        })?;

        let result = self
            .data
            .runtime()
            .get_prompt(session, &mapping.mcp_server, &mapping.target_name, payload.arguments)
            .await
            .map_err(|e| e.to_rpc_error())?;
        Ok(Some(serde_json::to_value(result).map_err(to_internal)?))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // resources
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_list_resources(&self, session: &Session) -> Result<Option<Value>, RpcError> {
        let mappings = self
            .data
            .resource_mappings(session)
            .await
            .map_err(|e| e.to_rpc_error())?;
        let resources = mappings.values().map(|m| m.target.clone()).collect();
        Ok(Some(
            serde_json::to_value(ListResourcesResult { resources }).map_err(to_internal)?,
        ))
    }

    async fn handle_list_resource_templates(
        &self,
        session: &Session,
    ) -> Result<Option<Value>, RpcError> {
        let mappings = self
            .data
            .resource_template_mappings(session)
            .await
            .map_err(|e| e.to_rpc_error())?;
        let resource_templates = mappings
            .values()
            .map(|m| m.target.resource_template.clone())
            .collect();
        Ok(Some(
            serde_json::to_value(ListResourceTemplatesResult { resource_templates })
                .map_err(to_internal)?,
        ))
    }

    async fn handle_read_resource(
        &self,
        session: &Session,
        msg: &Message,
    ) -> Result<Option<Value>, RpcError> {
        let payload: ReadResourceParams = msg.parse_params()?;
        let (server, resource_name) = self
            .data
            .match_published_resource(session, &payload.uri)
            .await
            .map_err(|e| e.to_rpc_error())?;

        let result = self
            .data
            .runtime()
            .read_resource(session, &server, &resource_name)
            .await
            .map_err(|e| e.to_rpc_error())?;
        Ok(Some(serde_json::to_value(result).map_err(to_internal)?))
    }

    async fn handle_subscribe(
        &self,
        session: &Session,
        msg: &Message,
        subscribe: bool,
    ) -> Result<Option<Value>, RpcError> {
        let payload: SubscribeParams = msg.parse_params()?;
        let uris = vec![payload.uri];
        let result = if subscribe {
            self.data.subscribe_to_resources(session, &uris).await
        } else {
            self.data.unsubscribe_from_resources(session, &uris).await
        };
        result.map_err(|e| e.to_rpc_error())?;
        Ok(Some(json!({})))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // logging & cancellation
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_set_log_level(
        &self,
        session: &Session,
        msg: &Message,
    ) -> Result<Option<Value>, RpcError> {
        let payload: SetLevelParams = msg.parse_params()?;
        let config = self.data.runtime().config(session);

        for server in config.mcp_servers.keys() {
            let client = self
                .data
                .runtime()
                .get_client(session, server)
                .await
                .map_err(|e| e.to_rpc_error())?;
            if let Some(client) = client.as_mcp() {
                client
                    .set_log_level(&payload.level)
                    .await
                    .map_err(|e| e.to_rpc_error())?;
            }
        }

        Ok(Some(json!({})))
    }

    fn handle_cancelled(&self, session: &Session, msg: &Message) -> Result<Option<Value>, RpcError> {
        let payload: CancelledParams = msg.parse_params()?;
        session.stop_all_from_request_id(
            &payload.request_id,
            payload.reason.unwrap_or_else(|| "cancelled by client".to_string()),
        );
        Ok(None)
    }
}

fn to_internal(e: serde_json::Error) -> RpcError {
    RpcError::internal(e.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Environment reconciliation
// ─────────────────────────────────────────────────────────────────────────────

/// Resolve every declared environment variable against the session's env
/// map. Missing required variables fail `initialize` with a structured
/// `missingEnv` payload for the UI to prompt on.
pub fn reconcile_env(session: &Session, config: &Config) -> Result<(), RpcError> {
    let env = session.env_map();
    let mut missing: Vec<&str> = Vec::new();

    for (key, def) in &config.env {
        let mut value = env.get(key).cloned().unwrap_or_default();

        if value.is_empty() && def.use_bearer_token {
            value = env.get(BEARER_TOKEN_ENV_KEY).cloned().unwrap_or_default();
        }
        if value.is_empty() && def.optional {
            value = def.default.clone();
        }
        if value.is_empty() && !def.optional {
            missing.push(key);
            continue;
        }

        session.set_env(key.clone(), value);
    }

    if missing.is_empty() {
        return Ok(());
    }

    let missing_env: Vec<Value> = missing
        .iter()
        .map(|key| {
            let def = &config.env[*key];
            let mut entry = json!({
                "name": key,
                "description": def.description,
                "default": def.default,
            });
            if !def.options.is_empty() {
                entry["options"] = json!(def.options);
            }
            entry
        })
        .collect();

    Err(
        RpcError::invalid_params(format!(
            "missing required environment variables: {missing:?}"
        ))
        .with_data(json!({"missingEnv": missing_env})),
    )
}
