//! Message transports for upstream MCP servers.
//!
//! A [`Transport`] is a duplex stream of JSON-RPC [`Message`]s. The in-memory
//! pair backs inline servers and tests; the HTTP variant speaks the
//! streamable-HTTP convention (one message per POST, response message in the
//! body).

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use nanobot_types::Message;

use crate::error::{McpError, Result};

/// Default per-request timeout for HTTP transports.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for an HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Endpoint receiving each JSON-RPC message as a POST body.
    pub url: String,
    /// Extra headers attached to every request.
    pub headers: BTreeMap<String, String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl HttpTransportConfig {
    /// Create a config for the given endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// Attach a header to every request.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A duplex JSON-RPC message stream.
pub struct Transport {
    outbound: mpsc::Sender<Message>,
    inbound: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl Transport {
    /// Build a transport from raw channel halves.
    pub fn from_channels(outbound: mpsc::Sender<Message>, inbound: mpsc::Receiver<Message>) -> Self {
        Self {
            outbound,
            inbound: Mutex::new(Some(inbound)),
        }
    }

    /// An in-memory duplex pair: whatever one side sends, the other receives.
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);
        (
            Transport::from_channels(a_tx, b_rx),
            Transport::from_channels(b_tx, a_rx),
        )
    }

    /// A transport speaking streamable HTTP: each outgoing message is POSTed
    /// to the endpoint, and a non-empty response body is delivered back as an
    /// inbound message.
    pub fn http(config: HttpTransportConfig) -> Transport {
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        let (in_tx, in_rx) = mpsc::channel::<Message>(64);

        tokio::spawn(async move {
            let client = match reqwest::Client::builder().timeout(config.timeout).build() {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build HTTP client");
                    return;
                }
            };

            while let Some(msg) = out_rx.recv().await {
                let mut request = client.post(&config.url).json(&msg);
                for (key, value) in &config.headers {
                    request = request.header(key, value);
                }

                let response = match request.send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(url = %config.url, error = %e, "HTTP transport send failed");
                        break;
                    }
                };

                if !response.status().is_success() {
                    tracing::warn!(
                        url = %config.url,
                        status = %response.status(),
                        "HTTP transport received non-success status"
                    );
                    continue;
                }

                let body = match response.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(url = %config.url, error = %e, "HTTP transport read failed");
                        break;
                    }
                };
                if body.is_empty() {
                    // Notifications are acknowledged with an empty body.
                    continue;
                }

                match serde_json::from_slice::<Message>(&body) {
                    Ok(reply) => {
                        if in_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(url = %config.url, error = %e, "HTTP transport returned invalid JSON-RPC");
                    }
                }
            }
        });

        Transport::from_channels(out_tx, in_rx)
    }

    /// A clone of the outbound sender half.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }

    /// Send one message to the peer.
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| McpError::TransportClosed)
    }

    /// Take the inbound receiver. The client's read loop owns it; taking it
    /// twice returns `None`.
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<Message>> {
        self.inbound.lock().await.take()
    }
}
