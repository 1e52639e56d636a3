//! MCP audit log collection.
//!
//! Entries buffer in memory and flush to a configured HTTP sink from a
//! single background task. The buffer wakes the flusher when it reaches
//! half capacity; failed batches re-enqueue at the head and retry on the
//! next pass.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Per-request timeout for the sink.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Overall bound on one flush attempt.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// One audited MCP call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    /// The JSON-RPC method, e.g. `tools/call`.
    pub call_type: String,
    /// The tool name or resource URI the call addressed.
    pub call_identifier: String,
    /// The client that issued the call.
    pub client_name: String,
    /// The session the call ran in.
    pub session_id: String,
    /// When the call arrived.
    pub created: Option<DateTime<Utc>>,
    /// Deployment metadata stamped onto every entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

struct CollectorInner {
    buffer: Mutex<Vec<AuditLog>>,
    batch_size: usize,
    kick: Mutex<Option<mpsc::Sender<()>>>,
    send_url: String,
    token: String,
    metadata: Option<BTreeMap<String, String>>,
}

/// A bounded audit buffer with a background flusher.
pub struct Collector {
    inner: Arc<CollectorInner>,
    flusher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Collector {
    /// Start a collector flushing to `send_url` every `flush_interval`, or
    /// sooner when the buffer reaches half of `2 × batch_size`.
    pub fn new(
        send_url: impl Into<String>,
        token: impl Into<String>,
        batch_size: usize,
        flush_interval: Duration,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Self {
        let (kick, kick_rx) = mpsc::channel(1);
        let inner = Arc::new(CollectorInner {
            buffer: Mutex::new(Vec::with_capacity(2 * batch_size)),
            batch_size,
            kick: Mutex::new(Some(kick)),
            send_url: send_url.into(),
            token: token.into(),
            metadata,
        });

        let flusher = tokio::spawn(run_flush_loop(inner.clone(), kick_rx, flush_interval));

        Self {
            inner,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Record one entry. Entries with an empty call type are responses and
    /// are dropped; chat-resource reads from the UI are dropped as noise.
    pub fn collect(&self, mut entry: AuditLog) {
        if entry.call_type.is_empty() {
            return;
        }
        if entry.client_name == "nanobot-ui"
            && entry.call_type == "resources/read"
            && entry.call_identifier.starts_with("chat://")
        {
            return;
        }

        entry.metadata = self.inner.metadata.clone();

        let should_kick = {
            let mut buffer = self.inner.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.push(entry);
            buffer.len() >= self.inner.batch_size
        };
        if should_kick {
            let kick = self.inner.kick.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(kick) = kick.as_ref() {
                let _ = kick.try_send(());
            }
        }
    }

    /// Entries waiting to flush.
    pub fn pending(&self) -> usize {
        self.inner.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop the flusher after one final drain. Closing the kick channel
    /// ends the loop once the last flush completes.
    pub async fn close(&self) {
        self.inner
            .kick
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let handle = self.flusher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_flush_loop(
    inner: Arc<CollectorInner>,
    mut kick: mpsc::Receiver<()>,
    flush_interval: Duration,
) {
    loop {
        let closed = tokio::select! {
            kicked = kick.recv() => kicked.is_none(),
            _ = tokio::time::sleep(flush_interval) => false,
        };

        if let Err(e) = flush(&inner).await {
            tracing::error!(error = %e, "failed to persist audit logs");
        }

        if closed {
            return;
        }
    }
}

async fn flush(inner: &CollectorInner) -> Result<(), String> {
    let batch = {
        let mut buffer = inner.buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.is_empty() {
            return Ok(());
        }
        std::mem::replace(&mut *buffer, Vec::with_capacity(2 * inner.batch_size))
    };

    let result = tokio::time::timeout(FLUSH_TIMEOUT, send_batch(inner, &batch))
        .await
        .unwrap_or_else(|_| Err("flush timed out".to_string()));

    if let Err(e) = result {
        // Retry on the next pass; the failed batch goes back to the head.
        let mut buffer = inner.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let mut restored = batch;
        restored.extend(buffer.drain(..));
        *buffer = restored;
        return Err(e);
    }

    Ok(())
}

async fn send_batch(inner: &CollectorInner, batch: &[AuditLog]) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(SEND_TIMEOUT)
        .build()
        .map_err(|e| e.to_string())?;

    let mut request = client.post(&inner.send_url).json(batch);
    if !inner.token.is_empty() {
        request = request.header("Authorization", format!("Bearer {}", inner.token));
    }

    let response = request.send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("unexpected status {status} sending audit logs: {body}"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(call_type: &str) -> AuditLog {
        AuditLog {
            call_type: call_type.to_string(),
            call_identifier: "read".to_string(),
            client_name: "test-client".to_string(),
            session_id: "s1".to_string(),
            created: Some(Utc::now()),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn responses_and_noise_are_filtered() {
        let collector = Collector::new("http://127.0.0.1:1/audit", "", 8, Duration::from_secs(3600), None);

        collector.collect(entry(""));
        assert_eq!(collector.pending(), 0);

        let mut noisy = entry("resources/read");
        noisy.client_name = "nanobot-ui".to_string();
        noisy.call_identifier = "chat://current".to_string();
        collector.collect(noisy);
        assert_eq!(collector.pending(), 0);

        collector.collect(entry("tools/call"));
        assert_eq!(collector.pending(), 1);
    }

    #[tokio::test]
    async fn metadata_is_stamped() {
        let mut metadata = BTreeMap::new();
        metadata.insert("deployment".to_string(), "test".to_string());
        let collector = Collector::new(
            "http://127.0.0.1:1/audit",
            "",
            8,
            Duration::from_secs(3600),
            Some(metadata),
        );

        collector.collect(entry("tools/call"));
        let buffer = collector.inner.buffer.lock().unwrap();
        assert_eq!(
            buffer[0].metadata.as_ref().unwrap()["deployment"],
            "test"
        );
    }

    #[tokio::test]
    async fn failed_flush_reenqueues_at_head() {
        // Nothing listens on the sink address, so the send fails and the
        // batch must survive.
        let collector = Collector::new(
            "http://127.0.0.1:1/audit",
            "",
            2,
            Duration::from_secs(3600),
            None,
        );

        collector.collect(entry("tools/call"));
        collector.collect(entry("resources/read"));

        // Reaching the batch size kicked the flusher; give it a moment.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let buffer = collector.inner.buffer.lock().unwrap();
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer[0].call_type, "tools/call");
        assert_eq!(buffer[1].call_type, "resources/read");
    }
}
