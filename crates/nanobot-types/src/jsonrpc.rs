//! JSON-RPC 2.0 envelope types.
//!
//! MCP frames every message as a JSON-RPC 2.0 envelope. A message with an
//! `id` and a `method` is a request; with an `id` and a `result` or `error`
//! it is a response; with a `method` and no `id` it is a notification.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

// ─────────────────────────────────────────────────────────────────────────────
// Request IDs
// ─────────────────────────────────────────────────────────────────────────────

/// A JSON-RPC request ID. The wire permits both integers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric ID, assigned by outbound clients.
    Number(i64),
    /// String ID, typically caller-supplied for cancellation pairing.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// One JSON-RPC 2.0 envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request ID; absent on notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Method name; absent on responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request or notification parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Result on success responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Message {
    /// Create a request.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Create a notification (no ID, no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Create a success response.
    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error_response(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    /// True when the message carries an ID and a method.
    pub fn is_request(&self) -> bool {
        self.id.is_some() && self.method.is_some()
    }

    /// True when the message carries an ID and a result or error.
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// True when the message carries a method and no ID.
    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }

    /// The `_meta` object carried in the params, if any.
    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.params.as_ref()?.get("_meta")?.as_object()
    }

    /// The progress token carried in `params._meta.progressToken`, if any.
    pub fn progress_token(&self) -> Option<Value> {
        self.meta()?.get("progressToken").cloned()
    }

    /// Decode the params into a typed payload.
    ///
    /// A missing or `null` params decodes to the payload's default, so
    /// handlers never see an error for an omitted parameter object.
    pub fn parse_params<T: serde::de::DeserializeOwned + Default>(&self) -> Result<T, RpcError> {
        match &self.params {
            None | Some(Value::Null) => Ok(T::default()),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| RpcError::invalid_params(e.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Optional additional data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Parse error - invalid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Invalid request - not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Method not found.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid params. Also carries `missingEnv` data during initialize.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The request was cancelled by the client.
    pub const REQUEST_CANCELLED: i64 = -32800;
    /// The peer connection closed with the request in flight.
    pub const TRANSPORT_CLOSED: i64 = -32000;
    /// The named tool has no mapping after a refresh.
    pub const TOOL_NOT_FOUND: i64 = -32001;
    /// No resource mapping or template matched the URI.
    pub const RESOURCE_NOT_FOUND: i64 = -32002;
    /// The agent loop reached its turn limit.
    pub const TURN_LIMIT_EXCEEDED: i64 = -32003;

    /// Create an error with the given code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach additional data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Method-not-found error for the given method name.
    pub fn method_not_found(method: impl std::fmt::Display) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// Invalid-params error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    /// Internal error. Implementations must not expose stack traces here.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    /// Request-cancelled error carrying the cancellation reason.
    pub fn request_cancelled(reason: impl Into<String>) -> Self {
        Self::new(Self::REQUEST_CANCELLED, reason)
    }

    /// Transport-closed error.
    pub fn transport_closed() -> Self {
        Self::new(Self::TRANSPORT_CLOSED, "transport closed")
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}
