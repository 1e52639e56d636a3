//! The per-client session.
//!
//! A [`Session`] threads every inbound message: it holds the attribute map,
//! the environment map, the ordered inbound filters, the in-flight request
//! registry, and the outbound half of the wire. Outbound requests block in
//! [`Session::exchange`] until the matching response arrives, the caller
//! aborts, the deadline passes, or the transport closes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use nanobot_types::{Message, RequestId, RpcError};

use crate::error::{Result, SessionError};

/// Default deadline for an outbound exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound a session may raise the exchange deadline to.
pub const MAX_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(120);

/// An inbound message filter. Runs before routing, in registration order.
/// Returns `Ok(Some(msg))` to pass (possibly rewritten), `Ok(None)` to drop,
/// or an error to fail the message.
pub type MessageFilter = Box<dyn Fn(&Session, Message) -> std::result::Result<Option<Message>, RpcError> + Send + Sync>;

/// Options for [`Session::exchange`].
#[derive(Default)]
pub struct ExchangeOptions {
    /// Caller-supplied request ID, used for cancellation pairing.
    pub request_id: Option<RequestId>,
    /// Deadline override, clamped to [`MAX_EXCHANGE_TIMEOUT`].
    pub timeout: Option<Duration>,
    /// Abort handle; cancelling it fails the exchange with `Cancelled`.
    pub abort: Option<CancellationToken>,
}

struct SessionInner {
    id: String,
    created: DateTime<Utc>,
    parent: RwLock<Option<Session>>,
    attributes: RwLock<HashMap<String, Value>>,
    env: RwLock<HashMap<String, String>>,
    filters: RwLock<Vec<MessageFilter>>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    cancel_reasons: Mutex<HashMap<RequestId, String>>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Message>>>,
    outbound: mpsc::Sender<Message>,
    next_id: AtomicI64,
    cancel: RwLock<CancellationToken>,
    closed: Mutex<bool>,
}

/// A per-client context-and-attribute bag. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a root session writing outbound messages to `outbound`.
    pub fn new(id: impl Into<String>, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                created: Utc::now(),
                parent: RwLock::new(None),
                attributes: RwLock::new(HashMap::new()),
                env: RwLock::new(HashMap::new()),
                filters: RwLock::new(Vec::new()),
                in_flight: Mutex::new(HashMap::new()),
                cancel_reasons: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                outbound,
                next_id: AtomicI64::new(1),
                cancel: RwLock::new(CancellationToken::new()),
                closed: Mutex::new(false),
            }),
        }
    }

    /// Create a child session. The child inherits a copy of the parent's
    /// environment map at creation time and a linked cancellation token, so
    /// cancelling the root cancels all descendants. Attribute reads do not
    /// fall through.
    pub fn child(&self, id: impl Into<String>, outbound: mpsc::Sender<Message>) -> Self {
        let child = Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                created: Utc::now(),
                parent: RwLock::new(Some(self.clone())),
                attributes: RwLock::new(HashMap::new()),
                env: RwLock::new(self.env_map()),
                filters: RwLock::new(Vec::new()),
                in_flight: Mutex::new(HashMap::new()),
                cancel_reasons: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                outbound,
                next_id: AtomicI64::new(1),
                cancel: RwLock::new(self.cancellation().child_token()),
                closed: Mutex::new(false),
            }),
        };
        child
    }

    /// The immutable session ID.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Creation time.
    pub fn created(&self) -> DateTime<Utc> {
        self.inner.created
    }

    /// The parent session, if any.
    pub fn parent(&self) -> Option<Session> {
        self.inner.parent.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Link this session under `parent`. Fails when the link would create a
    /// cycle. Re-links the cancellation token, so link before issuing
    /// requests.
    pub fn set_parent(&self, parent: &Session) -> Result<()> {
        let mut walk = Some(parent.clone());
        while let Some(node) = walk {
            if Arc::ptr_eq(&node.inner, &self.inner) {
                return Err(SessionError::ParentCycle);
            }
            walk = node.parent();
        }

        *self.inner.parent.write().unwrap_or_else(|e| e.into_inner()) = Some(parent.clone());
        *self.inner.cancel.write().unwrap_or_else(|e| e.into_inner()) =
            parent.cancellation().child_token();
        Ok(())
    }

    /// Walk parent pointers to the root. The parent graph is a tree, so this
    /// terminates.
    pub fn root(&self) -> Session {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// The session-level cancellation token.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Cancel this session and all descendants (children hold child tokens).
    pub fn cancel(&self) {
        self.cancellation().cancel();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Attributes & environment
    // ─────────────────────────────────────────────────────────────────────────

    /// Store an attribute. The value owns its encoding through serde.
    pub fn set<T: Serialize>(&self, key: impl Into<String>, value: &T) {
        if let Ok(encoded) = serde_json::to_value(value) {
            self.inner
                .attributes
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key.into(), encoded);
        }
    }

    /// Read an attribute, decoding lazily. Returns `None` when the key is
    /// missing or the stored value does not decode to `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let attrs = self.inner.attributes.read().unwrap_or_else(|e| e.into_inner());
        let value = attrs.get(key)?.clone();
        drop(attrs);
        serde_json::from_value(value).ok()
    }

    /// Remove an attribute. Returns true when it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.inner
            .attributes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some()
    }

    /// The attribute keys currently set.
    pub fn attribute_keys(&self) -> Vec<String> {
        self.inner
            .attributes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Serialize the attribute map to a durable JSON blob.
    pub fn snapshot(&self) -> Value {
        let attrs = self.inner.attributes.read().unwrap_or_else(|e| e.into_inner());
        Value::Object(attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Restore attributes from a snapshot produced by [`Session::snapshot`].
    pub fn restore(&self, snapshot: Value) {
        if let Value::Object(map) = snapshot {
            let mut attrs = self.inner.attributes.write().unwrap_or_else(|e| e.into_inner());
            attrs.clear();
            attrs.extend(map);
        }
    }

    /// A copy of the environment map.
    pub fn env_map(&self) -> HashMap<String, String> {
        self.inner.env.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Set an environment variable.
    pub fn set_env(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .env
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value.into());
    }

    /// Read one environment variable.
    pub fn env(&self, key: &str) -> Option<String> {
        self.inner.env.read().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Filters
    // ─────────────────────────────────────────────────────────────────────────

    /// Append an inbound filter. Filters run in registration order, before
    /// routing.
    pub fn add_filter(&self, filter: MessageFilter) {
        self.inner.filters.write().unwrap_or_else(|e| e.into_inner()).push(filter);
    }

    /// Run an inbound message through the filter chain and route responses to
    /// waiting exchanges. Returns `Ok(Some(msg))` when the message still
    /// needs handler routing, `Ok(None)` when it was dropped or consumed.
    pub fn accept(&self, msg: Message) -> std::result::Result<Option<Message>, RpcError> {
        let mut msg = msg;
        {
            let filters = self.inner.filters.read().unwrap_or_else(|e| e.into_inner());
            for filter in filters.iter() {
                match filter(self, msg)? {
                    Some(next) => msg = next,
                    None => return Ok(None),
                }
            }
        }

        if msg.is_response() {
            let id = msg.id.clone().expect("response carries an id");
            let sender = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(msg);
                    return Ok(None);
                }
                None => {
                    tracing::debug!(session_id = %self.inner.id, %id, "response with no waiter, dropping");
                    return Ok(None);
                }
            }
        }

        Ok(Some(msg))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound request lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Register `msg.id` in the in-flight table bound to a cancellable token,
    /// invoke the handler, and remove the registration on return. A second
    /// request with the same ID while one is in flight fails with
    /// `DuplicateRequestId`.
    pub async fn run<F, Fut, T>(&self, msg: &Message, handler: F) -> Result<T>
    where
        F: FnOnce(CancellationToken, Message) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.cancellation().child_token();

        if let Some(id) = msg.id.clone() {
            let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if in_flight.contains_key(&id) {
                return Err(SessionError::DuplicateRequestId(id));
            }
            in_flight.insert(id, token.clone());
        }

        let result = handler(token, msg.clone()).await;

        if let Some(id) = &msg.id {
            self.inner
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id);
        }

        result
    }

    /// Cancel the context registered under `id`; called upon receipt of
    /// `notifications/cancelled`.
    pub fn stop_all_from_request_id(&self, id: &RequestId, reason: impl Into<String>) {
        let reason = reason.into();
        self.inner
            .cancel_reasons
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), reason.clone());

        let token = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned();
        if let Some(token) = token {
            tracing::debug!(session_id = %self.inner.id, %id, %reason, "cancelling in-flight request");
            token.cancel();
        }
    }

    /// The reason supplied with a cancellation of `id`, if any.
    pub fn cancel_reason(&self, id: &RequestId) -> Option<String> {
        self.inner
            .cancel_reasons
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// True when a request with this ID is currently in flight.
    pub fn is_in_flight(&self, id: &RequestId) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────────

    /// Send an outbound request and block until the matching response,
    /// cancellation, or deadline.
    pub async fn exchange(
        &self,
        method: impl Into<String>,
        params: Value,
        opts: ExchangeOptions,
    ) -> Result<Value> {
        let method = method.into();
        let id = opts
            .request_id
            .unwrap_or_else(|| RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst)));

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.contains_key(&id) {
                return Err(SessionError::DuplicateRequestId(id));
            }
            pending.insert(id.clone(), tx);
        }

        let request = Message::request(id.clone(), method.clone(), Some(params));
        if self.send(request).await.is_err() {
            self.remove_pending(&id);
            return Err(SessionError::TransportClosed);
        }

        let timeout = opts
            .timeout
            .unwrap_or(DEFAULT_EXCHANGE_TIMEOUT)
            .min(MAX_EXCHANGE_TIMEOUT);
        let abort = opts.abort.unwrap_or_default();
        let session_cancel = self.cancellation();

        let response = tokio::select! {
            response = rx => response,
            _ = abort.cancelled() => {
                self.remove_pending(&id);
                self.notify_cancelled(&id, "aborted by caller").await;
                return Err(SessionError::Cancelled("aborted by caller".to_string()));
            }
            _ = session_cancel.cancelled() => {
                self.remove_pending(&id);
                self.notify_cancelled(&id, "session cancelled").await;
                return Err(SessionError::Cancelled("session cancelled".to_string()));
            }
            _ = tokio::time::sleep(timeout) => {
                self.remove_pending(&id);
                return Err(SessionError::Timeout);
            }
        };

        match response {
            Ok(msg) => {
                if let Some(err) = msg.error {
                    Err(SessionError::Peer(err))
                } else {
                    Ok(msg.result.unwrap_or(Value::Null))
                }
            }
            // Sender dropped: the transport closed with the request in flight.
            Err(_) => Err(SessionError::TransportClosed),
        }
    }

    /// Fire-and-forget outbound notification.
    pub async fn notify(&self, method: impl Into<String>, params: Value) -> Result<()> {
        self.send(Message::notification(method, Some(params))).await
    }

    /// Resolve an inbound request with a success result.
    pub async fn reply(&self, id: RequestId, result: Value) -> Result<()> {
        self.send(Message::response(id, result)).await
    }

    /// Resolve an inbound request with an error.
    pub async fn reply_error(&self, id: RequestId, error: RpcError) -> Result<()> {
        self.send(Message::error_response(id, error)).await
    }

    /// Send a raw message outbound.
    pub async fn send(&self, msg: Message) -> Result<()> {
        if *self.inner.closed.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(SessionError::TransportClosed);
        }
        self.inner
            .outbound
            .send(msg)
            .await
            .map_err(|_| SessionError::TransportClosed)
    }

    async fn notify_cancelled(&self, id: &RequestId, reason: &str) {
        let params = serde_json::json!({"requestId": id, "reason": reason});
        let _ = self
            .send(Message::notification("notifications/cancelled", Some(params)))
            .await;
    }

    /// Tear the session down: in-flight outbound exchanges complete with
    /// `TransportClosed`, the cancellation token fires, and further sends
    /// fail.
    pub fn close(&self) {
        {
            let mut closed = self.inner.closed.lock().unwrap_or_else(|e| e.into_inner());
            if *closed {
                return;
            }
            *closed = true;
        }

        // Dropping the senders completes the waiters with TransportClosed.
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.cancel();
        tracing::debug!(session_id = %self.inner.id, "session closed");
    }

    fn remove_pending(&self, id: &RequestId) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("parent", &self.parent().map(|p| p.id().to_string()))
            .finish()
    }
}
