//! Per-session data: mapping caches, config hash, subscriptions.
//!
//! [`SessionData`] maintains the tool/prompt/resource/template mappings under
//! well-known session attribute keys, synchronizes configuration at the top
//! of every inbound message, and answers published-resource lookups with a
//! `(agent, uri)` memoization cache.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use nanobot_session::Session;
use nanobot_types::{
    AgentDisplay, Config, Prompt, PromptMappings, ResourceMappings, ResourceUpdatedParams,
    TargetMapping, ToolMappings, ToolRef,
    config::{
        ACCOUNT_ID_SESSION_KEY, CONFIG_HASH_SESSION_KEY, CONFIG_SESSION_KEY,
        CURRENT_AGENT_SESSION_KEY, PUBLIC_URL_SESSION_KEY, RESOURCE_SUBSCRIPTIONS_SESSION_KEY,
    },
    protocol::ResourceTemplate,
};

use crate::error::{Result, RuntimeError};
use crate::registry::{Runtime, RuntimeClient};
use crate::template;

// ─────────────────────────────────────────────────────────────────────────────
// Attribute keys
// ─────────────────────────────────────────────────────────────────────────────

/// Session key caching the tool mappings.
pub const TOOL_MAPPING_KEY: &str = "toolMapping";
/// Session key caching the prompt mappings.
pub const PROMPT_MAPPING_KEY: &str = "promptMapping";
/// Session key caching the resource mappings.
pub const RESOURCE_MAPPING_KEY: &str = "resourceMapping";
/// Session key caching the resource template mappings.
pub const RESOURCE_TEMPLATE_MAPPING_KEY: &str = "resourceTemplateMapping";
/// Session key memoizing `(agent, uri)` template matches.
pub const RESOURCE_TEMPLATE_MAPPING_CACHE_KEY: &str = "resourceTemplateMappingCache";
/// Session key caching the agent display list.
pub const AGENTS_SESSION_KEY: &str = "agents";

const SUBSCRIPTIONS_INITIALIZED_KEY: &str = "_subscriptions_initialized";

/// A compiled resource template mapping target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMatch {
    /// Compiled anchored regex source for the URI template.
    pub pattern: String,
    /// The template descriptor as published to clients.
    pub resource_template: ResourceTemplate,
}

/// Published template name → target.
pub type ResourceTemplateMappings = BTreeMap<String, TargetMapping<TemplateMatch>>;

/// Identity and transport facts derived from the current request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Authenticated account, when the transport authenticated one.
    pub account_id: Option<String>,
    /// The externally visible URL of this request.
    pub public_url: Option<String>,
    /// A config override carried by the transport (e.g. a test harness).
    pub config: Option<Config>,
}

/// Produces the session's config when the request carries no override.
pub type ConfigFactory =
    Arc<dyn Fn(&Session) -> std::result::Result<Config, String> + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// SessionData
// ─────────────────────────────────────────────────────────────────────────────

/// Mapping and configuration state for sessions, backed by the runtime.
#[derive(Clone)]
pub struct SessionData {
    runtime: Arc<Runtime>,
}

impl SessionData {
    /// Create a data layer over the runtime.
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// The backing runtime.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────────────────────

    /// Reconcile the session with the current request. Runs at the top of
    /// every inbound message: records the account, installs the subscription
    /// filter, stores the public URL, loads the config, and invalidates all
    /// caches when the `{config, env}` hash changed.
    pub fn sync(&self, session: &Session, ctx: &RequestContext, default_config: &ConfigFactory) -> Result<()> {
        if let Some(account_id) = &ctx.account_id {
            session.set(ACCOUNT_ID_SESSION_KEY, account_id);
        }

        self.init_subscriptions(session);

        if let Some(url) = &ctx.public_url {
            session.set(PUBLIC_URL_SESSION_KEY, url);
        }

        let config = match &ctx.config {
            Some(config) => config.clone(),
            None => default_config(session).map_err(RuntimeError::Config)?,
        };
        session.set(CONFIG_SESSION_KEY, &config);

        let existing: Option<String> = session.get(CONFIG_HASH_SESSION_KEY);
        let hash = config_hash(&config, session);
        if existing.as_deref() != Some(hash.as_str()) {
            self.refresh(session, true);
        }
        session.set(CONFIG_HASH_SESSION_KEY, &hash);

        Ok(())
    }

    /// Drop the mapping caches; with `close`, also close every cached
    /// upstream client for the session.
    pub fn refresh(&self, session: &Session, close: bool) {
        if close {
            self.runtime.close_session_clients(session);
        }

        session.delete(TOOL_MAPPING_KEY);
        session.delete(CURRENT_AGENT_SESSION_KEY);
        session.delete(PROMPT_MAPPING_KEY);
        session.delete(RESOURCE_MAPPING_KEY);
        session.delete(RESOURCE_TEMPLATE_MAPPING_KEY);
        session.delete(RESOURCE_TEMPLATE_MAPPING_CACHE_KEY);
        session.delete(AGENTS_SESSION_KEY);

        tracing::debug!(session_id = %session.id(), close, "session caches refreshed");
    }

    /// Install the one-shot filter suppressing `notifications/resources/updated`
    /// for URIs the client has not subscribed to.
    fn init_subscriptions(&self, session: &Session) {
        if session.get::<bool>(SUBSCRIPTIONS_INITIALIZED_KEY).unwrap_or(false) {
            return;
        }

        session.add_filter(Box::new(|session, msg| {
            if msg.method.as_deref() != Some("notifications/resources/updated") {
                return Ok(Some(msg));
            }
            let Ok(params) = msg.parse_params::<ResourceUpdatedParams>() else {
                return Ok(Some(msg));
            };
            let subs: BTreeSet<String> = session
                .get(RESOURCE_SUBSCRIPTIONS_SESSION_KEY)
                .unwrap_or_default();
            if subs.contains(&params.uri) {
                Ok(Some(msg))
            } else {
                Ok(None)
            }
        }));

        session.set(SUBSCRIPTIONS_INITIALIZED_KEY, &true);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Published surface
    // ─────────────────────────────────────────────────────────────────────────

    /// Entrypoint agents plus explicitly published servers.
    pub fn published_servers(&self, session: &Session) -> Vec<String> {
        let config = self.runtime.config(session);
        let mut servers: Vec<String> = config
            .publish
            .entrypoint
            .iter()
            .filter(|key| config.agents.contains_key(*key))
            .cloned()
            .collect();
        servers.extend(config.publish.mcp_servers.iter().cloned());
        servers
    }

    /// The tool mappings, built on first use and cached in the session.
    pub async fn tool_mappings(&self, session: &Session, force_fetch: bool) -> Result<ToolMappings> {
        if !force_fetch {
            if let Some(cached) = session.get::<ToolMappings>(TOOL_MAPPING_KEY) {
                return Ok(cached);
            }
        }

        let config = self.runtime.config(session);
        let mut refs = self.published_servers(session);
        refs.extend(config.publish.tools.iter().cloned());

        let mappings = self.runtime.build_tool_mappings(session, &refs).await?;
        session.set(TOOL_MAPPING_KEY, &mappings);
        Ok(mappings)
    }

    /// The prompt mappings, cached like tools.
    pub async fn prompt_mappings(&self, session: &Session) -> Result<PromptMappings> {
        if let Some(cached) = session.get::<PromptMappings>(PROMPT_MAPPING_KEY) {
            return Ok(cached);
        }

        let config = self.runtime.config(session);
        let mut refs = self.published_servers(session);
        refs.extend(config.publish.prompts.iter().cloned());

        let mappings = self.build_prompt_mappings(session, &refs).await?;
        session.set(PROMPT_MAPPING_KEY, &mappings);
        Ok(mappings)
    }

    /// Build prompt mappings from refs: inline prompts first-class, remote
    /// prompts fetched per server; failed refs are logged and skipped.
    pub async fn build_prompt_mappings(&self, session: &Session, refs: &[String]) -> Result<PromptMappings> {
        let config = self.runtime.config(session);
        let mut mappings = PromptMappings::new();

        for raw in refs {
            let tool_ref = ToolRef::parse(raw);
            if tool_ref.server.is_empty() {
                continue;
            }

            if tool_ref.tool.is_empty() {
                if let Some(inline) = config.prompts.get(&tool_ref.server) {
                    let published = tool_ref.published_name(&tool_ref.server);
                    mappings.insert(
                        published.clone(),
                        TargetMapping {
                            mcp_server: tool_ref.server.clone(),
                            target_name: tool_ref.server.clone(),
                            target: inline.to_prompt(published),
                        },
                    );
                    continue;
                }
            }

            let client = match self.runtime.get_client(session, &tool_ref.server).await {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!(
                        session_id = %session.id(),
                        server = %tool_ref.server,
                        error = %e,
                        "skipping ref while building prompt mappings"
                    );
                    continue;
                }
            };
            let Some(client) = client.as_mcp() else { continue };

            let prompts = match client.list_prompts().await {
                Ok(result) => result.prompts,
                Err(e) => {
                    tracing::error!(
                        session_id = %session.id(),
                        server = %tool_ref.server,
                        error = %e,
                        "skipping ref after prompts/list failure"
                    );
                    continue;
                }
            };

            for prompt in prompts {
                if !tool_ref.tool.is_empty() && prompt.name != tool_ref.tool {
                    continue;
                }
                let published = tool_ref.published_name(&prompt.name);
                let mut target: Prompt = prompt.clone();
                target.name = published.clone();
                mappings.insert(
                    published,
                    TargetMapping {
                        mcp_server: tool_ref.server.clone(),
                        target_name: prompt.name,
                        target,
                    },
                );
            }
        }

        Ok(mappings)
    }

    /// The resource mappings, cached in the session.
    pub async fn resource_mappings(&self, session: &Session) -> Result<ResourceMappings> {
        if let Some(cached) = session.get::<ResourceMappings>(RESOURCE_MAPPING_KEY) {
            return Ok(cached);
        }

        let config = self.runtime.config(session);
        let mut refs = self.published_servers(session);
        refs.extend(config.publish.resources.iter().cloned());

        let mut mappings = ResourceMappings::new();
        for raw in &refs {
            let tool_ref = ToolRef::parse(raw);
            if tool_ref.server.is_empty() {
                continue;
            }

            let Some(client) = self.mcp_client_or_skip(session, &tool_ref.server, "resource").await
            else {
                continue;
            };

            let resources = match client.list_resources().await {
                Ok(result) => result.resources,
                Err(e) => {
                    tracing::error!(
                        session_id = %session.id(),
                        server = %tool_ref.server,
                        error = %e,
                        "skipping ref after resources/list failure"
                    );
                    continue;
                }
            };

            for resource in resources {
                let published = tool_ref.published_name(&resource.uri);
                mappings.insert(
                    published,
                    TargetMapping {
                        mcp_server: tool_ref.server.clone(),
                        target_name: resource.uri.clone(),
                        target: resource,
                    },
                );
            }
        }

        session.set(RESOURCE_MAPPING_KEY, &mappings);
        Ok(mappings)
    }

    /// The resource template mappings, cached in the session. Templates that
    /// fail to compile are logged and skipped.
    pub async fn resource_template_mappings(&self, session: &Session) -> Result<ResourceTemplateMappings> {
        if let Some(cached) = session.get::<ResourceTemplateMappings>(RESOURCE_TEMPLATE_MAPPING_KEY) {
            return Ok(cached);
        }

        let config = self.runtime.config(session);
        let mut refs = self.published_servers(session);
        refs.extend(config.publish.resource_templates.iter().cloned());

        let mut mappings = ResourceTemplateMappings::new();
        for raw in &refs {
            let tool_ref = ToolRef::parse(raw);
            if tool_ref.server.is_empty() {
                continue;
            }

            let Some(client) = self.mcp_client_or_skip(session, &tool_ref.server, "template").await
            else {
                continue;
            };

            let templates = match client.list_resource_templates().await {
                Ok(result) => result.resource_templates,
                Err(e) => {
                    tracing::error!(
                        session_id = %session.id(),
                        server = %tool_ref.server,
                        error = %e,
                        "skipping ref after resources/templates/list failure"
                    );
                    continue;
                }
            };

            for resource_template in templates {
                let pattern = match template::compile(&resource_template.uri_template) {
                    Ok(pattern) => pattern,
                    Err(e) => {
                        tracing::error!(
                            session_id = %session.id(),
                            template = %resource_template.uri_template,
                            error = %e,
                            "skipping template that fails to compile"
                        );
                        continue;
                    }
                };
                let published = tool_ref.published_name(&resource_template.uri_template);
                mappings.insert(
                    published,
                    TargetMapping {
                        mcp_server: tool_ref.server.clone(),
                        target_name: resource_template.uri_template.clone(),
                        target: TemplateMatch {
                            pattern,
                            resource_template,
                        },
                    },
                );
            }
        }

        session.set(RESOURCE_TEMPLATE_MAPPING_KEY, &mappings);
        Ok(mappings)
    }

    async fn mcp_client_or_skip(
        &self,
        session: &Session,
        server: &str,
        what: &str,
    ) -> Option<nanobot_mcp::McpClient> {
        match self.runtime.get_client(session, server).await {
            Ok(RuntimeClient::Mcp(client)) => Some(client),
            Ok(_) => None,
            Err(e) => {
                tracing::error!(
                    session_id = %session.id(),
                    server = %server,
                    error = %e,
                    "skipping ref while building {what} mappings"
                );
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Resource matching
    // ─────────────────────────────────────────────────────────────────────────

    /// Resolve a published resource URI to `(server, resourceName)`: exact
    /// mapping first, then templates in sorted key order. Hits and template
    /// matches are memoized per `(currentAgent, uri)`.
    pub async fn match_published_resource(&self, session: &Session, uri: &str) -> Result<(String, String)> {
        let cache_key = format!("{}::{}", self.current_agent(session), uri);

        let mut cache: BTreeMap<String, (String, String)> = session
            .get(RESOURCE_TEMPLATE_MAPPING_CACHE_KEY)
            .unwrap_or_default();
        if let Some((server, name)) = cache.get(&cache_key) {
            return Ok((server.clone(), name.clone()));
        }

        let resources = self.resource_mappings(session).await?;
        if let Some(mapping) = resources.get(uri) {
            let hit = (mapping.mcp_server.clone(), uri.to_string());
            cache.insert(cache_key, hit.clone());
            session.set(RESOURCE_TEMPLATE_MAPPING_CACHE_KEY, &cache);
            return Ok(hit);
        }

        let templates = self.resource_template_mappings(session).await?;
        for mapping in templates.values() {
            if template::matches(&mapping.target.pattern, uri) {
                let hit = (mapping.mcp_server.clone(), uri.to_string());
                cache.insert(cache_key, hit.clone());
                session.set(RESOURCE_TEMPLATE_MAPPING_CACHE_KEY, &cache);
                return Ok(hit);
            }
        }

        Err(RuntimeError::ResourceNotFound(uri.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    /// Record subscriptions and forward them to the owning upstreams that
    /// advertise the capability.
    pub async fn subscribe_to_resources(&self, session: &Session, uris: &[String]) -> Result<()> {
        let mut subs: BTreeSet<String> = session
            .get(RESOURCE_SUBSCRIPTIONS_SESSION_KEY)
            .unwrap_or_default();

        for uri in uris {
            if subs.contains(uri) {
                continue;
            }

            let (server, resource_name) = self.match_published_resource(session, uri).await?;
            let client = self.runtime.get_client(session, &server).await?;
            if let Some(client) = client.as_mcp() {
                if client.supports_resource_subscribe() {
                    client.subscribe_resource(&resource_name).await?;
                }
            }
            subs.insert(uri.clone());
        }

        session.set(RESOURCE_SUBSCRIPTIONS_SESSION_KEY, &subs);
        Ok(())
    }

    /// Symmetric to subscribe.
    pub async fn unsubscribe_from_resources(&self, session: &Session, uris: &[String]) -> Result<()> {
        let mut subs: BTreeSet<String> = session
            .get(RESOURCE_SUBSCRIPTIONS_SESSION_KEY)
            .unwrap_or_default();

        for uri in uris {
            if !subs.contains(uri) {
                continue;
            }

            let (server, resource_name) = self.match_published_resource(session, uri).await?;
            let client = self.runtime.get_client(session, &server).await?;
            if let Some(client) = client.as_mcp() {
                if client.supports_resource_subscribe() {
                    client.unsubscribe_resource(&resource_name).await?;
                }
            }
            subs.remove(uri);
        }

        session.set(RESOURCE_SUBSCRIPTIONS_SESSION_KEY, &subs);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Current agent
    // ─────────────────────────────────────────────────────────────────────────

    /// The selected entrypoint agent, falling back to the first entrypoint.
    pub fn current_agent(&self, session: &Session) -> String {
        if let Some(agent) = session.get::<String>(CURRENT_AGENT_SESSION_KEY) {
            return agent;
        }
        self.runtime
            .config(session)
            .publish
            .entrypoint
            .first()
            .cloned()
            .unwrap_or_default()
    }

    /// Select an entrypoint agent. An empty name clears the selection.
    pub fn set_current_agent(&self, session: &Session, agent: &str) -> Result<()> {
        if agent == self.current_agent(session) {
            return Ok(());
        }

        let root = session.root();
        self.refresh(session, false);

        if agent.is_empty() {
            root.delete(CURRENT_AGENT_SESSION_KEY);
            return Ok(());
        }

        let config = self.runtime.config(session);
        if !config.publish.entrypoint.iter().any(|e| e == agent) {
            return Err(RuntimeError::Config(format!(
                "agent {agent:?} not found in entrypoints"
            )));
        }

        root.set(CURRENT_AGENT_SESSION_KEY, &agent.to_string());
        Ok(())
    }

    /// The display list of entrypoint agents and published servers.
    pub async fn agents(&self, session: &Session) -> Result<Vec<AgentDisplay>> {
        if let Some(cached) = session.get::<Vec<AgentDisplay>>(AGENTS_SESSION_KEY) {
            return Ok(cached);
        }

        let config = self.runtime.config(session);
        let current = self.current_agent(session);
        let mut agents = Vec::new();

        for key in &config.publish.entrypoint {
            if let Some(agent) = config.agents.get(key) {
                let name = if !agent.name.is_empty() {
                    agent.name.clone()
                } else {
                    key.clone()
                };
                agents.push(AgentDisplay {
                    id: key.clone(),
                    name,
                    description: agent.description.clone(),
                    current: *key == current,
                });
            } else if config.mcp_servers.contains_key(key) {
                let client = self.runtime.get_client(session, key).await?;
                let name = client
                    .init_result()
                    .map(|r| r.server_info.name)
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| key.clone());
                agents.push(AgentDisplay {
                    id: key.clone(),
                    name,
                    description: config
                        .mcp_servers
                        .get(key)
                        .map(|s| s.description.trim().to_string())
                        .unwrap_or_default(),
                    current: *key == current,
                });
            }
        }

        session.set(AGENTS_SESSION_KEY, &agents);
        Ok(agents)
    }
}

/// Hash the `{config, env}` pair that gates cache invalidation.
pub fn config_hash(config: &Config, session: &Session) -> String {
    #[derive(Serialize)]
    struct Hashed<'a> {
        config: &'a Config,
        env: BTreeMap<String, String>,
    }

    let env: BTreeMap<String, String> = session.env_map().into_iter().collect();
    let encoded = serde_json::to_vec(&Hashed { config, env }).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    format!("{digest:x}")
}
