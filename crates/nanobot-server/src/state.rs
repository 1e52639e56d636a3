//! Shared server state: the session table and the inbound pipeline.
//!
//! Each session owns an outbound pump that turns server-to-client messages
//! into events on the session's [`EventLog`]; both framings (WebSocket and
//! SSE) consume that log. Inbound messages run through the session's filter
//! chain, then dispatch on their own task.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use nanobot_runtime::RequestContext;
use nanobot_session::Session;
use nanobot_types::{AGENT_TOOL_PREFIX, ELICITATION_CREATE_METHOD, Message, RpcError};

use crate::events::{EventLog, names};
use crate::handler::{BEARER_TOKEN_ENV_KEY, McpServer};
use crate::threads::{ThreadInfo, ThreadStore};

/// One live session and its event stream.
#[derive(Clone)]
pub struct SessionHandle {
    pub session: Session,
    pub events: Arc<EventLog>,
}

struct AppStateInner {
    server: McpServer,
    threads: Arc<dyn ThreadStore>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

/// Server state shared across transports. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

impl AppState {
    /// Create state over a dispatch server and thread store.
    pub fn new(server: McpServer, threads: Arc<dyn ThreadStore>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                server,
                threads,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The dispatch server.
    pub fn server(&self) -> &McpServer {
        &self.inner.server
    }

    /// The thread store.
    pub fn threads(&self) -> &Arc<dyn ThreadStore> {
        &self.inner.threads
    }

    /// Look up a session by ID.
    pub fn session(&self, id: &str) -> Option<SessionHandle> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Fetch or create the session named by `id`; a `None` ID mints a new
    /// session.
    pub fn get_or_create_session(&self, id: Option<&str>, ctx: &RequestContext) -> SessionHandle {
        if let Some(id) = id {
            if let Some(handle) = self.session(id) {
                return handle;
            }
        }

        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(256);
        let session = Session::new(id.clone(), outbound_tx);
        let events = Arc::new(EventLog::new());

        tokio::spawn(pump_outbound(events.clone(), outbound_rx));

        let handle = SessionHandle {
            session: session.clone(),
            events,
        };
        self.inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), handle.clone());

        if let Some(account) = &ctx.account_id {
            let threads = self.inner.threads.clone();
            let account = account.clone();
            let info = ThreadInfo {
                session_id: id.clone(),
                title: "New chat".to_string(),
                created: chrono::Utc::now(),
            };
            tokio::spawn(async move {
                threads.put(&account, info).await;
            });
        }

        tracing::info!(session_id = %id, "session created");
        handle
    }

    /// Close a session and drop it from the table.
    pub fn close_session(&self, id: &str) {
        let handle = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if let Some(handle) = handle {
            self.inner
                .server
                .data()
                .runtime()
                .close_session_clients(&handle.session);
            handle.session.close();
            tracing::info!(session_id = %id, "session closed");
        }
    }

    /// Feed one raw inbound payload into a session: parse, filter, and
    /// dispatch on its own task. Handlers run concurrently; only delivery
    /// into this method is ordered per stream.
    pub fn handle_inbound(
        &self,
        handle: &SessionHandle,
        ctx: RequestContext,
        bearer_token: Option<String>,
        payload: &str,
    ) {
        let msg: Message = match serde_json::from_str(payload) {
            Ok(msg) => msg,
            Err(e) => {
                handle.events.publish(
                    names::ERROR,
                    serde_json::json!({"code": RpcError::PARSE_ERROR, "message": e.to_string()}),
                );
                return;
            }
        };

        if let Some(token) = bearer_token {
            handle.session.set_env(BEARER_TOKEN_ENV_KEY, token);
        }

        let msg = match handle.session.accept(msg) {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e) => {
                handle
                    .events
                    .publish(names::ERROR, serde_json::json!({"code": e.code, "message": e.message}));
                return;
            }
        };

        let state = self.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let chat = is_chat_call(&msg);
            if chat {
                handle
                    .events
                    .publish(names::CHAT_IN_PROGRESS, serde_json::json!({}));
            }

            state
                .inner
                .server
                .on_message(&handle.session, &ctx, msg)
                .await;

            if chat {
                handle.events.publish(names::CHAT_DONE, serde_json::json!({}));
            }
        });
    }
}

/// True for `tools/call` requests that target an agent chat tool.
fn is_chat_call(msg: &Message) -> bool {
    if msg.method.as_deref() != Some("tools/call") {
        return false;
    }
    msg.params
        .as_ref()
        .and_then(|p| p.get("name"))
        .and_then(serde_json::Value::as_str)
        .map(|name| name.starts_with(AGENT_TOOL_PREFIX))
        .unwrap_or(false)
}

/// Drain a session's outbound channel into its event log. Elicitations are
/// surfaced twice: once as the JSON-RPC `message` and once as the named
/// `elicitation/create` event for UI consumers.
async fn pump_outbound(events: Arc<EventLog>, mut outbound: mpsc::Receiver<Message>) {
    while let Some(msg) = outbound.recv().await {
        let payload = match serde_json::to_value(&msg) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode outbound message");
                continue;
            }
        };

        if msg.method.as_deref() == Some(ELICITATION_CREATE_METHOD) {
            events.publish(names::ELICITATION_CREATE, payload.clone());
        }
        events.publish(names::MESSAGE, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use nanobot_mcp::Transport;
    use nanobot_runtime::{Connector, Runtime, RuntimeError, SessionData};
    use nanobot_types::{Config, McpServerDef};

    use crate::threads::InMemoryThreadStore;

    struct NoConnector;

    #[async_trait]
    impl Connector for NoConnector {
        async fn connect(
            &self,
            _server: &str,
            _def: &McpServerDef,
            _session: &Session,
        ) -> Result<Transport, RuntimeError> {
            Err(RuntimeError::Config("no upstreams".to_string()))
        }
    }

    fn test_state() -> AppState {
        let runtime = Arc::new(Runtime::new(Arc::new(NoConnector)));
        let data = SessionData::new(runtime);
        let factory: nanobot_runtime::ConfigFactory = Arc::new(|_s| Ok(Config::default()));
        AppState::new(
            McpServer::new(data, factory),
            Arc::new(InMemoryThreadStore::new()),
        )
    }

    #[tokio::test]
    async fn sessions_are_created_and_reused() {
        let state = test_state();
        let ctx = RequestContext::default();

        let a = state.get_or_create_session(None, &ctx);
        let b = state.get_or_create_session(Some(a.session.id()), &ctx);
        assert_eq!(a.session.id(), b.session.id());

        let c = state.get_or_create_session(None, &ctx);
        assert_ne!(a.session.id(), c.session.id());
    }

    #[tokio::test]
    async fn outbound_messages_become_events() {
        let state = test_state();
        let handle = state.get_or_create_session(None, &RequestContext::default());
        let mut live = handle.events.subscribe();

        handle
            .session
            .notify("notifications/progress", serde_json::json!({"progress": 1}))
            .await
            .unwrap();

        let event = live.recv().await.unwrap();
        assert_eq!(event.event, names::MESSAGE);
        assert_eq!(event.data["method"], "notifications/progress");
    }

    #[tokio::test]
    async fn invalid_json_surfaces_an_error_event() {
        let state = test_state();
        let handle = state.get_or_create_session(None, &RequestContext::default());
        let mut live = handle.events.subscribe();

        state.handle_inbound(&handle, RequestContext::default(), None, "not json");

        let event = live.recv().await.unwrap();
        assert_eq!(event.event, names::ERROR);
        assert_eq!(event.data["code"], RpcError::PARSE_ERROR);
    }

    #[tokio::test]
    async fn ping_round_trips_through_the_event_log() {
        let state = test_state();
        let handle = state.get_or_create_session(None, &RequestContext::default());
        let mut live = handle.events.subscribe();

        let ping = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string();
        state.handle_inbound(&handle, RequestContext::default(), None, &ping);

        let event = live.recv().await.unwrap();
        assert_eq!(event.event, names::MESSAGE);
        assert_eq!(event.data["id"], 1);
        assert!(event.data["result"].is_object());
    }

    #[tokio::test]
    async fn close_session_drops_the_handle() {
        let state = test_state();
        let handle = state.get_or_create_session(None, &RequestContext::default());
        let id = handle.session.id().to_string();

        state.close_session(&id);
        assert!(state.session(&id).is_none());
    }
}
