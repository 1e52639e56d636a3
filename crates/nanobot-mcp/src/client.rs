//! The outbound JSON-RPC peer to one upstream MCP server.
//!
//! Lifecycle: `Init → Ready → Closing → Closed`. The initialize handshake
//! records the upstream's `InitializeResult`; requests issued before the
//! handshake completes wait for it. Any I/O failure fails the pending
//! requests with `TransportClosed` and drives the client to `Closed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use nanobot_types::{
    CallToolParams, CallToolResult, GetPromptResult, InitializeParams, InitializeResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, Message,
    ProgressParams, ReadResourceResult, RequestId, Tool,
};

use crate::error::{McpError, Result};
use crate::transport::Transport;

/// Bound on the initialize handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected, handshake not yet complete.
    Init,
    /// Handshake complete, requests flowing.
    Ready,
    /// Tearing down; pending requests are failing.
    Closing,
    /// Terminal.
    Closed,
}

/// Handler invoked for inbound notifications and requests that are not
/// responses or routed progress events.
pub type NotificationHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Per-call options.
#[derive(Default)]
pub struct CallOptions {
    /// Progress token forwarded as `_meta.progressToken`.
    pub progress_token: Option<Value>,
    /// Extra `_meta` entries forwarded with the call.
    pub meta: Option<Map<String, Value>>,
    /// Local sink for progress notifications matching the token.
    pub progress: Option<mpsc::Sender<ProgressParams>>,
    /// Abort handle; cancelling also notifies the peer.
    pub abort: Option<CancellationToken>,
    /// Deadline override.
    pub timeout: Option<Duration>,
}

struct ClientInner {
    server: String,
    outbound: mpsc::Sender<Message>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Message>>>,
    progress_sinks: Mutex<HashMap<String, mpsc::Sender<ProgressParams>>>,
    notifications: Mutex<Option<NotificationHandler>>,
    init_result: Mutex<Option<InitializeResult>>,
    next_id: AtomicI64,
    state: Mutex<ClientState>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    read_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// An MCP client connected to a single upstream server. Cheap to clone.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

impl McpClient {
    /// Attach a client to a transport and start its read loop. The client is
    /// in `Init` until [`McpClient::initialize`] completes.
    pub async fn connect(server: impl Into<String>, transport: Transport) -> Result<Self> {
        let server = server.into();
        let inbound = transport
            .take_inbound()
            .await
            .ok_or(McpError::Transport("transport already attached".to_string()))?;
        let (ready_tx, ready_rx) = watch::channel(false);

        let client = Self {
            inner: Arc::new(ClientInner {
                server: server.clone(),
                outbound: transport.sender(),
                pending: Mutex::new(HashMap::new()),
                progress_sinks: Mutex::new(HashMap::new()),
                notifications: Mutex::new(None),
                init_result: Mutex::new(None),
                next_id: AtomicI64::new(1),
                state: Mutex::new(ClientState::Init),
                ready_tx,
                ready_rx,
                read_task: Mutex::new(None),
            }),
        };

        let task = tokio::spawn(read_loop(client.clone(), inbound));
        *client.inner.read_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        tracing::debug!(server = %server, "MCP client connected");
        Ok(client)
    }

    /// The upstream server key.
    pub fn server(&self) -> &str {
        &self.inner.server
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The recorded `InitializeResult`, once the handshake completed.
    pub fn init_result(&self) -> Option<InitializeResult> {
        self.inner.init_result.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Install the handler for inbound notifications (resource updates,
    /// list-changed events, unrouted progress) and server-initiated requests.
    pub fn on_notification(&self, handler: NotificationHandler) {
        *self.inner.notifications.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Handshake
    // ─────────────────────────────────────────────────────────────────────────

    /// Perform the initialize handshake: send `initialize`, record the
    /// result, then send `notifications/initialized`. Idempotent once Ready.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        if let Some(result) = self.init_result() {
            return Ok(result);
        }

        let params = serde_json::to_value(InitializeParams::default())?;
        let result = self
            .raw_exchange(
                "initialize",
                params,
                CallOptions {
                    timeout: Some(HANDSHAKE_TIMEOUT),
                    ..Default::default()
                },
            )
            .await?;
        let init: InitializeResult = serde_json::from_value(result)?;

        self.send(Message::notification("notifications/initialized", None))
            .await?;

        tracing::info!(
            server = %self.inner.server,
            upstream = %init.server_info.name,
            protocol = %init.protocol_version,
            "MCP upstream initialized"
        );

        *self.inner.init_result.lock().unwrap_or_else(|e| e.into_inner()) = Some(init.clone());
        self.set_state(ClientState::Ready);
        let _ = self.inner.ready_tx.send(true);
        Ok(init)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Issue a request, waiting for the handshake first.
    pub async fn exchange(&self, method: &str, params: Value, opts: CallOptions) -> Result<Value> {
        self.await_ready().await?;
        self.raw_exchange(method, params, opts).await
    }

    async fn await_ready(&self) -> Result<()> {
        match self.state() {
            ClientState::Ready => Ok(()),
            ClientState::Closing | ClientState::Closed => Err(McpError::Closed),
            ClientState::Init => {
                let mut rx = self.inner.ready_rx.clone();
                let wait = async {
                    while !*rx.borrow_and_update() {
                        if rx.changed().await.is_err() {
                            return Err(McpError::Closed);
                        }
                    }
                    Ok(())
                };
                tokio::time::timeout(HANDSHAKE_TIMEOUT, wait)
                    .await
                    .map_err(|_| McpError::NotInitialized)?
            }
        }
    }

    async fn raw_exchange(&self, method: &str, mut params: Value, opts: CallOptions) -> Result<Value> {
        if matches!(self.state(), ClientState::Closing | ClientState::Closed) {
            return Err(McpError::Closed);
        }

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));

        // Fold the progress token and extra meta into params._meta.
        if opts.progress_token.is_some() || opts.meta.is_some() {
            let obj = params.as_object_mut().ok_or_else(|| {
                McpError::Transport("params with _meta must be an object".to_string())
            })?;
            let meta = obj
                .entry("_meta")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(meta_obj) = meta.as_object_mut() {
                if let Some(extra) = &opts.meta {
                    for (k, v) in extra {
                        meta_obj.insert(k.clone(), v.clone());
                    }
                }
                if let Some(token) = &opts.progress_token {
                    meta_obj.insert("progressToken".to_string(), token.clone());
                }
            }
        }

        if let (Some(token), Some(sink)) = (&opts.progress_token, &opts.progress) {
            self.inner
                .progress_sinks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(token_key(token), sink.clone());
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);

        let send_result = self.send(Message::request(id.clone(), method, Some(params))).await;
        if send_result.is_err() {
            self.clear_call(&id, &opts);
            return Err(McpError::TransportClosed);
        }

        let abort = opts.abort.clone().unwrap_or_default();
        let timeout = opts.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let response = tokio::select! {
            response = rx => response,
            _ = abort.cancelled() => {
                self.clear_call(&id, &opts);
                let params = json!({"requestId": id, "reason": "request cancelled"});
                let _ = self
                    .send(Message::notification("notifications/cancelled", Some(params)))
                    .await;
                return Err(McpError::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                self.clear_call(&id, &opts);
                return Err(McpError::Timeout);
            }
        };

        self.clear_call(&id, &opts);
        match response {
            Ok(msg) => match msg.error {
                Some(err) => Err(McpError::Peer(err)),
                None => Ok(msg.result.unwrap_or(Value::Null)),
            },
            Err(_) => Err(McpError::TransportClosed),
        }
    }

    fn clear_call(&self, id: &RequestId, opts: &CallOptions) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if let Some(token) = &opts.progress_token {
            self.inner
                .progress_sinks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&token_key(token));
        }
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.inner
            .outbound
            .send(msg)
            .await
            .map_err(|_| McpError::TransportClosed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MCP methods
    // ─────────────────────────────────────────────────────────────────────────

    /// `tools/list`.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let result = self
            .exchange("tools/list", json!({}), CallOptions::default())
            .await?;
        let list: ListToolsResult = serde_json::from_value(result)?;
        Ok(list.tools)
    }

    /// `tools/call`, forwarding the progress token and meta.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        opts: CallOptions,
    ) -> Result<CallToolResult> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
            meta: None,
        })?;
        let result = self.exchange("tools/call", params, opts).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `prompts/list`.
    pub async fn list_prompts(&self) -> Result<ListPromptsResult> {
        let result = self
            .exchange("prompts/list", json!({}), CallOptions::default())
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `prompts/get`.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<GetPromptResult> {
        let result = self
            .exchange(
                "prompts/get",
                json!({"name": name, "arguments": arguments}),
                CallOptions::default(),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `resources/list`.
    pub async fn list_resources(&self) -> Result<ListResourcesResult> {
        let result = self
            .exchange("resources/list", json!({}), CallOptions::default())
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `resources/templates/list`.
    pub async fn list_resource_templates(&self) -> Result<ListResourceTemplatesResult> {
        let result = self
            .exchange("resources/templates/list", json!({}), CallOptions::default())
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `resources/read`.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let result = self
            .exchange("resources/read", json!({"uri": uri}), CallOptions::default())
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `resources/subscribe`. Only attempted when the upstream advertises
    /// `resources.subscribe`.
    pub async fn subscribe_resource(&self, uri: &str) -> Result<()> {
        if !self.supports_resource_subscribe() {
            return Err(McpError::CapabilityUnsupported("resources.subscribe"));
        }
        self.exchange("resources/subscribe", json!({"uri": uri}), CallOptions::default())
            .await?;
        Ok(())
    }

    /// `resources/unsubscribe`, gated like subscribe.
    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        if !self.supports_resource_subscribe() {
            return Err(McpError::CapabilityUnsupported("resources.subscribe"));
        }
        self.exchange("resources/unsubscribe", json!({"uri": uri}), CallOptions::default())
            .await?;
        Ok(())
    }

    /// `logging/setLevel`.
    pub async fn set_log_level(&self, level: &str) -> Result<()> {
        self.exchange("logging/setLevel", json!({"level": level}), CallOptions::default())
            .await?;
        Ok(())
    }

    /// `ping`.
    pub async fn ping(&self) -> Result<()> {
        self.exchange("ping", json!({}), CallOptions::default()).await?;
        Ok(())
    }

    /// Whether the recorded capabilities advertise resource subscription.
    pub fn supports_resource_subscribe(&self) -> bool {
        self.init_result()
            .map(|r| r.capabilities.supports_resource_subscribe())
            .unwrap_or(false)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────────

    /// Close the client. Idempotent. Pending requests fail with
    /// `TransportClosed`; `forceful` additionally aborts the read loop
    /// immediately.
    pub fn close(&self, forceful: bool) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, ClientState::Closing | ClientState::Closed) {
                return;
            }
            *state = ClientState::Closing;
        }

        self.fail_pending();

        if forceful {
            if let Some(task) = self
                .inner
                .read_task
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                task.abort();
            }
        }

        self.set_state(ClientState::Closed);
        let _ = self.inner.ready_tx.send(false);
        tracing::debug!(server = %self.inner.server, forceful, "MCP client closed");
    }

    fn fail_pending(&self) {
        // Dropping the response senders completes the waiters with
        // TransportClosed.
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.inner
            .progress_sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn set_state(&self, state: ClientState) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server", &self.inner.server)
            .field("state", &self.state())
            .finish()
    }
}

fn token_key(token: &Value) -> String {
    match token {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn read_loop(client: McpClient, mut inbound: mpsc::Receiver<Message>) {
    while let Some(msg) = inbound.recv().await {
        if msg.is_response() {
            let id = msg.id.clone().expect("response carries an id");
            let sender = client
                .inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => {
                    tracing::debug!(server = %client.inner.server, %id, "response with no waiter");
                }
            }
            continue;
        }

        if msg.method.as_deref() == Some("notifications/progress") {
            if let Ok(progress) = msg.parse_params::<ProgressParams>() {
                let sink = client
                    .inner
                    .progress_sinks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&token_key(&progress.progress_token))
                    .cloned();
                if let Some(sink) = sink {
                    let _ = sink.send(progress).await;
                    continue;
                }
            }
        }

        let handler = client
            .inner
            .notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(msg);
        } else {
            tracing::debug!(
                server = %client.inner.server,
                method = msg.method.as_deref().unwrap_or(""),
                "unhandled upstream message"
            );
        }
    }

    // Peer hung up: Ready → Closing → Closed, failing pending requests.
    if !matches!(client.state(), ClientState::Closed) {
        tracing::info!(server = %client.inner.server, "upstream transport closed");
        client.set_state(ClientState::Closing);
        client.fail_pending();
        client.set_state(ClientState::Closed);
        let _ = client.inner.ready_tx.send(false);
    }
}
