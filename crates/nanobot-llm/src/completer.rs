//! The [`Completer`] trait and the scripted mock used across the workspace.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nanobot_types::{
    ChatMessage, CompletionItem, CompletionProgress, CompletionRequest, CompletionResponse,
    ToolCall,
};

use crate::error::{LlmError, Result};

/// A sink for streamed partial outputs. Wired to the caller's progress token
/// by whoever invokes the completer.
pub type ProgressSink = mpsc::Sender<CompletionProgress>;

/// Options for a single completion.
#[derive(Default, Clone)]
pub struct CompletionOptions {
    /// Sink receiving partial content as it materializes.
    pub progress: Option<ProgressSink>,
    /// The opaque correlator the caller uses for routing, echoed back in
    /// progress payloads.
    pub progress_token: Option<Value>,
    /// Cancellation handle; implementations must abort in-flight HTTP work
    /// when it fires.
    pub cancel: CancellationToken,
}

/// The abstract completion engine contract.
///
/// Implementations must emit progress events to the options' sink for
/// partial content and must honor cancellation between HTTP open and the
/// final streamed token.
#[async_trait]
pub trait Completer: Send + Sync {
    /// Produce one completion for the request.
    async fn complete(
        &self,
        request: CompletionRequest,
        opts: CompletionOptions,
    ) -> Result<CompletionResponse>;

    /// The completer's name, for logs.
    fn name(&self) -> &str;
}

/// A completer that can be shared across tasks.
pub type SharedCompleter = Arc<dyn Completer>;

/// Best-effort progress emission; a full or closed sink drops the event
/// rather than stalling the completion.
pub fn send_progress(sink: &ProgressSink, progress: CompletionProgress) {
    if let Err(e) = sink.try_send(progress) {
        tracing::debug!(error = %e, "dropping completion progress event");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock completer
// ─────────────────────────────────────────────────────────────────────────────

/// One scripted mock outcome.
pub enum MockOutcome {
    /// Return this response.
    Response(CompletionResponse),
    /// Fail with this backend error.
    Error(String),
    /// Wait for cancellation, then fail with `Cancelled`.
    HangUntilCancelled,
}

/// A scripted completer for tests: returns outcomes in order and records
/// every request it sees.
pub struct MockCompleter {
    outcomes: Mutex<Vec<MockOutcome>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockCompleter {
    /// A completer that replays the given outcomes in order.
    pub fn new(outcomes: Vec<MockOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A completer that answers every request with the same text.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self::new(vec![MockOutcome::Response(Self::text_response(text))])
    }

    /// Build a plain text assistant response.
    pub fn text_response(text: impl Into<String>) -> CompletionResponse {
        CompletionResponse {
            output: ChatMessage::assistant_text(text),
            model: "mock-model".to_string(),
        }
    }

    /// Build a response planning the given tool calls.
    pub fn tool_call_response(calls: Vec<(&str, &str, Value)>) -> CompletionResponse {
        let items = calls
            .into_iter()
            .map(|(call_id, name, args)| CompletionItem {
                id: Uuid::new_v4().to_string(),
                tool_call: Some(ToolCall {
                    call_id: call_id.to_string(),
                    name: name.to_string(),
                    arguments: args.to_string(),
                    id: Uuid::new_v4().to_string(),
                }),
                ..Default::default()
            })
            .collect();
        CompletionResponse {
            output: ChatMessage {
                id: Uuid::new_v4().to_string(),
                role: "assistant".to_string(),
                created: None,
                items,
            },
            model: "mock-model".to_string(),
        }
    }

    /// Every request made so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of requests made so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Completer for MockCompleter {
    async fn complete(
        &self,
        request: CompletionRequest,
        opts: CompletionOptions,
    ) -> Result<CompletionResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        if opts.cancel.is_cancelled() {
            return Err(LlmError::Cancelled("cancelled before completion".to_string()));
        }

        let outcome = {
            let mut outcomes = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
            if outcomes.is_empty() {
                return Err(LlmError::backend("MockCompleter: no more responses"));
            }
            outcomes.remove(0)
        };

        match outcome {
            MockOutcome::Response(response) => {
                if let Some(sink) = &opts.progress {
                    for item in &response.output.items {
                        send_progress(
                            sink,
                            CompletionProgress {
                                model: response.model.clone(),
                                message_id: response.output.id.clone(),
                                role: response.output.role.clone(),
                                partial: false,
                                has_more: false,
                                item: item.clone(),
                            },
                        );
                    }
                }
                Ok(response)
            }
            MockOutcome::Error(message) => Err(LlmError::Backend(message)),
            MockOutcome::HangUntilCancelled => {
                opts.cancel.cancelled().await;
                Err(LlmError::Cancelled("cancelled while streaming".to_string()))
            }
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_returns_responses_in_order() {
        let completer = MockCompleter::new(vec![
            MockOutcome::Response(MockCompleter::text_response("first")),
            MockOutcome::Response(MockCompleter::text_response("second")),
        ]);

        let r1 = completer
            .complete(CompletionRequest::default(), CompletionOptions::default())
            .await
            .unwrap();
        let r2 = completer
            .complete(CompletionRequest::default(), CompletionOptions::default())
            .await
            .unwrap();

        assert_eq!(r1.text(), "first");
        assert_eq!(r2.text(), "second");
        assert_eq!(completer.request_count(), 2);
    }

    #[tokio::test]
    async fn mock_exhaustion_errors() {
        let completer = MockCompleter::new(vec![]);
        let err = completer
            .complete(CompletionRequest::default(), CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Backend(_)));
    }

    #[tokio::test]
    async fn mock_emits_progress_per_item() {
        let completer = MockCompleter::with_text("streamed");
        let (tx, mut rx) = mpsc::channel(8);

        completer
            .complete(
                CompletionRequest::default(),
                CompletionOptions {
                    progress: Some(tx),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.role, "assistant");
        assert_eq!(
            progress.item.content.as_ref().unwrap().as_text(),
            Some("streamed")
        );
    }

    #[tokio::test]
    async fn mock_hang_resolves_on_cancel() {
        let completer = MockCompleter::new(vec![MockOutcome::HangUntilCancelled]);
        let cancel = CancellationToken::new();

        let call = {
            let cancel = cancel.clone();
            async move {
                completer
                    .complete(
                        CompletionRequest::default(),
                        CompletionOptions {
                            cancel,
                            ..Default::default()
                        },
                    )
                    .await
            }
        };

        let handle = tokio::spawn(call);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn tool_call_response_preserves_order() {
        let response = MockCompleter::tool_call_response(vec![
            ("c1", "read", json!({"path": "a"})),
            ("c2", "write", json!({"path": "b"})),
        ]);
        let calls = response.tool_calls();
        assert_eq!(calls[0].name, "read");
        assert_eq!(calls[1].name, "write");
    }
}
