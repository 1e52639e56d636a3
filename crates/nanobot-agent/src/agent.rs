//! The agent completion loop.
//!
//! One invocation of [`Agents::run`] drives a run to completion: populate
//! the request from the agent's configuration and conversation history,
//! compact if the context budget is near exceeded, call the completer,
//! execute planned tool calls strictly in completer order, feed the results
//! back, and repeat until a response plans no further calls. Cancellation
//! terminates the run with a synthetic assistant message.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nanobot_mcp::CallOptions;
use nanobot_runtime::{AgentInvoker, Runtime, RuntimeError};
use nanobot_session::Session;
use nanobot_types::{
    COMPLETION_PROGRESS_META_KEY, CallResult, ChatMessage, CompletionItem, CompletionProgress,
    CompletionRequest, CompletionResponse, Content, OutputSchema, ProgressParams,
    RequestId, ResourceContents, ToolCallResult, ToolMappings, ToolUseDefinition,
    config::AgentConfig,
};

use nanobot_llm::{CompletionOptions, LlmError, SharedCompleter};

use crate::compact::{compact, context_window_size, should_compact};
use crate::elicit::Confirmations;
use crate::error::{AgentError, Result};
use crate::truncate::truncate_tool_result;

/// Bound on the number of turns per run.
pub const DEFAULT_MAX_TURNS: u32 = 50;
/// Call-meta key carrying the originating request ID, used to look up the
/// cancellation reason.
pub const REQUEST_ID_META_KEY: &str = "ai.nanobot.meta/request-id";

fn history_key(agent: &str) -> String {
    format!("agent/{agent}/history")
}

fn archive_key(agent: &str) -> String {
    format!("agent/{agent}/archive")
}

// ─────────────────────────────────────────────────────────────────────────────
// Run state
// ─────────────────────────────────────────────────────────────────────────────

struct ToolOutput {
    items: Vec<CompletionItem>,
    done: bool,
}

/// One completion-turn run. Lives for the duration of a single agent tool
/// invocation.
struct Run {
    /// The inbound request: the new user messages only.
    request: CompletionRequest,
    /// The merged request sent to the completer each turn.
    populated_request: CompletionRequest,
    tool_mappings: ToolMappings,
    response: Option<CompletionResponse>,
    tool_outputs: HashMap<String, ToolOutput>,
    done: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Agents
// ─────────────────────────────────────────────────────────────────────────────

/// The agent completion engine.
pub struct Agents {
    runtime: Arc<Runtime>,
    completer: SharedCompleter,
    confirmations: Confirmations,
    workspace_root: PathBuf,
    max_turns: u32,
}

impl Agents {
    /// Create an engine over the runtime and completer.
    pub fn new(runtime: Arc<Runtime>, completer: SharedCompleter) -> Self {
        Self {
            runtime,
            completer,
            confirmations: Confirmations,
            workspace_root: PathBuf::from("."),
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    /// Anchor truncation spill files under this directory.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Override the turn limit.
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Drive one run to completion and return its terminal output.
    pub async fn run(
        &self,
        session: &Session,
        agent_name: &str,
        arguments: Option<Map<String, Value>>,
        opts: CallOptions,
    ) -> Result<CallResult> {
        let config = self.runtime.config(session);
        let agent = config
            .agents
            .get(agent_name)
            .cloned()
            .ok_or_else(|| AgentError::AgentNotDefined(agent_name.to_string()))?;

        let new_input = vec![user_message_from_args(arguments.as_ref())];
        let history: Vec<ChatMessage> = session.get(&history_key(agent_name)).unwrap_or_default();
        let mut archived: Vec<ChatMessage> = session.get(&archive_key(agent_name)).unwrap_or_default();

        let mut refs: Vec<String> = agent.tools.clone();
        refs.extend(agent.mcp_servers.iter().cloned());
        refs.extend(agent.agents.iter().cloned());
        let tool_mappings = self.runtime.build_tool_mappings(session, &refs).await?;
        let tools = tool_definitions(&tool_mappings);

        let cancel = opts.abort.clone().unwrap_or_default();
        let progress = ProgressForwarder::start(session, opts.progress_token.clone());

        let mut input = history;
        input.extend(new_input.iter().cloned());

        let mut run = Run {
            request: CompletionRequest {
                model: agent.model.clone(),
                input: new_input.clone(),
                ..Default::default()
            },
            populated_request: CompletionRequest::default(),
            tool_mappings,
            response: None,
            tool_outputs: HashMap::new(),
            done: false,
        };

        let mut turns = 0u32;
        let result = loop {
            if run.done {
                // Every planned call is marked done and the last response
                // carried no further calls.
                break self.final_result(session, agent_name, &mut run, &mut input, &archived);
            }

            turns += 1;
            if turns > self.max_turns {
                return Err(AgentError::TurnLimitExceeded(self.max_turns));
            }

            run.populated_request = self.populate(&agent, &tools, &input);

            // Compact before the completer call when the budget is near
            // exceeded; the summary replaces the superseded history in-place.
            let window = context_window_size(agent.context_window);
            if should_compact(&run.populated_request, window) {
                tracing::info!(
                    session_id = %session.id(),
                    agent = %agent_name,
                    turns,
                    "compacting conversation before completion"
                );
                let compacted = compact(
                    self.completer.as_ref(),
                    &run.populated_request,
                    &run.request.input,
                    &archived,
                )
                .await?;
                input = compacted.compacted_input;
                archived = compacted.archived_messages;
                run.populated_request = self.populate(&agent, &tools, &input);
            }

            tracing::debug!(
                session_id = %session.id(),
                agent = %agent_name,
                turns,
                messages = run.populated_request.input.len(),
                tools = run.populated_request.tools.len(),
                model = %run.populated_request.model,
                "calling completer"
            );

            let response = match self
                .completer
                .complete(
                    run.populated_request.clone(),
                    CompletionOptions {
                        progress: progress.sink(),
                        progress_token: opts.progress_token.clone(),
                        cancel: cancel.clone(),
                    },
                )
                .await
            {
                Ok(response) => response,
                Err(LlmError::Cancelled(_)) => {
                    break self.cancelled_result(session, &opts, &progress);
                }
                Err(e) => return Err(e.into()),
            };

            let planned: Vec<_> = response.tool_calls().into_iter().cloned().collect();
            run.response = Some(response.clone());

            if planned.is_empty() {
                run.done = true;
                continue;
            }

            // Execute planned calls serially, in completer order.
            let mut result_items = Vec::new();
            let mut cancelled = false;
            for call in &planned {
                if run.tool_outputs.get(&call.call_id).map(|o| o.done).unwrap_or(false) {
                    continue;
                }
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }

                progress.emit_item(CompletionItem {
                    id: Uuid::new_v4().to_string(),
                    tool_call: Some(call.clone()),
                    ..Default::default()
                });

                let output = self
                    .invoke(session, &run, call, &cancel, &opts)
                    .await?;

                progress.emit_item(output.items[0].clone());
                result_items.extend(output.items.clone());
                run.tool_outputs.insert(call.call_id.clone(), output);
            }

            if cancelled {
                break self.cancelled_result(session, &opts, &progress);
            }

            // Feed the assistant plan and the tool results back for the
            // next turn.
            input.push(response.output.clone());
            input.push(ChatMessage {
                id: Uuid::new_v4().to_string(),
                role: "user".to_string(),
                created: None,
                items: result_items,
            });
        };

        progress.finish().await;
        Ok(result)
    }

    /// Persist the conversation and shape the terminal output from the
    /// run's last response.
    fn final_result(
        &self,
        session: &Session,
        agent_name: &str,
        run: &mut Run,
        input: &mut Vec<ChatMessage>,
        archived: &[ChatMessage],
    ) -> CallResult {
        let Some(response) = run.response.take() else {
            return CallResult::default();
        };

        input.push(response.output.clone());
        session.set(&history_key(agent_name), input);
        session.set(&archive_key(agent_name), &archived.to_vec());

        tracing::info!(session_id = %session.id(), agent = %agent_name, "run completed");

        CallResult {
            content: response
                .output
                .items
                .iter()
                .filter_map(|i| i.content.clone())
                .collect(),
            model: response.model,
            agent: agent_name.to_string(),
            stop_reason: "end_turn".to_string(),
            ..Default::default()
        }
    }

    /// Merge the agent's configuration with the conversation.
    fn populate(
        &self,
        agent: &AgentConfig,
        tools: &[ToolUseDefinition],
        input: &[ChatMessage],
    ) -> CompletionRequest {
        CompletionRequest {
            model: agent.model.clone(),
            input: input.to_vec(),
            system_prompt: agent.instructions.clone(),
            tools: tools.to_vec(),
            tool_choice: agent.tool_choice.clone(),
            temperature: agent.temperature,
            top_p: agent.top_p,
            max_tokens: agent.max_tokens,
            output_schema: agent.output.as_ref().map(|o| OutputSchema {
                name: o.name.clone(),
                description: o.description.clone(),
                schema: o.schema.clone(),
                strict: o.strict,
            }),
            ..Default::default()
        }
    }

    /// Resolve, confirm, dispatch, and truncate one tool call.
    async fn invoke(
        &self,
        session: &Session,
        run: &Run,
        call: &nanobot_types::ToolCall,
        cancel: &CancellationToken,
        opts: &CallOptions,
    ) -> Result<ToolOutput> {
        let mapping = run
            .tool_mappings
            .get(&call.name)
            .ok_or_else(|| AgentError::ToolNotMapped(call.name.clone()))?;

        let arguments: Option<Map<String, Value>> = if call.arguments.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(&call.arguments)
                    .map_err(|e| AgentError::InvalidArguments(e.to_string()))?,
            )
        };

        let config = self.runtime.config(session);
        let output = match self
            .confirmations
            .confirm(session, &config, &mapping.mcp_server, call)
            .await?
        {
            Some(rejection) => rejection,
            None => {
                let result = self
                    .runtime
                    .call(
                        session,
                        &mapping.mcp_server,
                        &mapping.target_name,
                        arguments,
                        CallOptions {
                            progress_token: opts.progress_token.clone(),
                            abort: Some(cancel.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                truncate_tool_result(
                    &self.workspace_root,
                    session.id(),
                    &call.name,
                    &call.call_id,
                    result,
                )
            }
        };

        tracing::debug!(
            session_id = %session.id(),
            tool = %call.name,
            call_id = %call.call_id,
            is_error = output.is_error,
            "tool call finished"
        );

        Ok(ToolOutput {
            items: vec![CompletionItem {
                id: Uuid::new_v4().to_string(),
                tool_call_result: Some(ToolCallResult {
                    call_id: call.call_id.clone(),
                    output,
                }),
                ..Default::default()
            }],
            done: true,
        })
    }

    /// The terminal output for a cancelled run: a synthetic assistant
    /// message, also emitted through the progress token.
    fn cancelled_result(
        &self,
        session: &Session,
        opts: &CallOptions,
        progress: &ProgressForwarder,
    ) -> CallResult {
        let reason = opts
            .meta
            .as_ref()
            .and_then(|m| m.get(REQUEST_ID_META_KEY))
            .and_then(|v| serde_json::from_value::<RequestId>(v.clone()).ok())
            .and_then(|id| session.cancel_reason(&id))
            .unwrap_or_else(|| "request cancelled".to_string());

        let text = format!("REQUEST CANCELLED: {reason}");
        let item = CompletionItem::from_content(Content::text(text.clone()));
        progress.emit_item(item);

        tracing::info!(session_id = %session.id(), reason = %reason, "run cancelled");

        CallResult {
            content: vec![Content::text(text)],
            stop_reason: "cancelled".to_string(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl AgentInvoker for Agents {
    async fn call_agent(
        &self,
        session: &Session,
        agent: &str,
        arguments: Option<Map<String, Value>>,
        opts: CallOptions,
    ) -> std::result::Result<CallResult, RuntimeError> {
        self.run(session, agent, arguments, opts)
            .await
            .map_err(|e| RuntimeError::Rpc(e.to_rpc_error()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn user_message_from_args(arguments: Option<&Map<String, Value>>) -> ChatMessage {
    let prompt = arguments
        .and_then(|a| a.get("prompt"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let mut msg = ChatMessage::user_text(prompt);

    if let Some(attachments) = arguments
        .and_then(|a| a.get("attachments"))
        .and_then(Value::as_array)
    {
        for attachment in attachments {
            let url = attachment.get("url").and_then(Value::as_str).unwrap_or("");
            if url.is_empty() {
                continue;
            }
            msg.items.push(CompletionItem::from_content(Content::Resource {
                resource: ResourceContents {
                    uri: url.to_string(),
                    mime_type: attachment
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    ..Default::default()
                },
                meta: None,
            }));
        }
    }

    msg
}

fn tool_definitions(mappings: &ToolMappings) -> Vec<ToolUseDefinition> {
    mappings
        .iter()
        .map(|(published, mapping)| ToolUseDefinition {
            name: published.clone(),
            description: mapping.target.description.clone().unwrap_or_default(),
            parameters: mapping.target.input_schema.clone(),
        })
        .collect()
}

/// Forwards completion progress events to the session as
/// `notifications/progress`, preserving emission order for the token.
struct ProgressForwarder {
    sink: Option<mpsc::Sender<CompletionProgress>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ProgressForwarder {
    fn start(session: &Session, progress_token: Option<Value>) -> Self {
        let Some(token) = progress_token else {
            return Self { sink: None, task: None };
        };

        let (tx, mut rx) = mpsc::channel::<CompletionProgress>(64);
        let session = session.clone();
        let task = tokio::spawn(async move {
            let mut sequence = 0f64;
            while let Some(event) = rx.recv().await {
                sequence += 1.0;
                let mut meta = Map::new();
                if let Ok(payload) = serde_json::to_value(&event) {
                    meta.insert(COMPLETION_PROGRESS_META_KEY.to_string(), payload);
                }
                let params = ProgressParams {
                    progress_token: token.clone(),
                    progress: sequence,
                    total: None,
                    meta: Some(meta),
                };
                if let Ok(value) = serde_json::to_value(&params) {
                    let _ = session.notify("notifications/progress", value).await;
                }
            }
        });

        Self {
            sink: Some(tx),
            task: Some(task),
        }
    }

    fn sink(&self) -> Option<mpsc::Sender<CompletionProgress>> {
        self.sink.clone()
    }

    fn emit_item(&self, item: CompletionItem) {
        if let Some(sink) = &self.sink {
            let _ = sink.try_send(CompletionProgress {
                role: "assistant".to_string(),
                item,
                ..Default::default()
            });
        }
    }

    /// Drain the forwarder so queued events flush before the reply.
    async fn finish(mut self) {
        self.sink.take();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
