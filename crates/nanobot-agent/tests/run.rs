//! End-to-end tests for the agent completion loop, using a scripted
//! completer and in-memory upstream servers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nanobot_agent::{AUTO_APPROVE_SESSION_KEY, AgentError, Agents};
use nanobot_llm::{MockCompleter, MockOutcome};
use nanobot_mcp::{CallOptions, Transport};
use nanobot_runtime::{Connector, Runtime, RuntimeError};
use nanobot_session::Session;
use nanobot_types::{
    AgentConfig, Config, Message, McpServerDef, config::CONFIG_SESSION_KEY,
};

/// Upstream whose single tool returns a configurable payload.
struct OneToolConnector {
    tool: &'static str,
    payload: String,
}

#[async_trait]
impl Connector for OneToolConnector {
    async fn connect(
        &self,
        _server: &str,
        _def: &McpServerDef,
        _session: &Session,
    ) -> Result<Transport, RuntimeError> {
        let (client_side, server_side) = Transport::pair();
        let tool = self.tool;
        let payload = self.payload.clone();

        tokio::spawn(async move {
            let mut inbound = server_side.take_inbound().await.unwrap();
            while let Some(msg) = inbound.recv().await {
                let Some(id) = msg.id.clone() else { continue };
                let reply = match msg.method.as_deref() {
                    Some("initialize") => json!({
                        "protocolVersion": "2025-06-18",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "one-tool", "version": "0"}
                    }),
                    Some("tools/list") => json!({"tools": [{"name": tool}]}),
                    Some("tools/call") => {
                        json!({"content": [{"type": "text", "text": payload}]})
                    }
                    _ => json!({}),
                };
                let _ = server_side.send(Message::response(id, reply)).await;
            }
        });

        Ok(client_side)
    }
}

fn agent_config(tools: Vec<String>) -> Config {
    let mut config = Config::default();
    config.agents.insert(
        "planner".to_string(),
        AgentConfig {
            model: "test-model".to_string(),
            instructions: "You plan things.".to_string(),
            mcp_servers: tools,
            ..Default::default()
        },
    );
    config
        .mcp_servers
        .insert("files".to_string(), McpServerDef::default());
    config
}

fn session_with(config: &Config) -> (Session, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(256);
    let session = Session::new("sess-agent", tx);
    session.set(CONFIG_SESSION_KEY, config);
    (session, rx)
}

fn prompt_args(text: &str) -> Option<Map<String, Value>> {
    let mut args = Map::new();
    args.insert("prompt".to_string(), json!(text));
    Some(args)
}

fn engine(completer: MockCompleter, root: &std::path::Path) -> (Agents, Arc<Runtime>) {
    let runtime = Arc::new(Runtime::new(Arc::new(OneToolConnector {
        tool: "read",
        payload: "file contents".to_string(),
    })));
    let agents = Agents::new(runtime.clone(), Arc::new(completer)).with_workspace_root(root);
    (agents, runtime)
}

#[tokio::test]
async fn plain_run_returns_final_text() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (agents, _runtime) = engine(MockCompleter::with_text("All planned."), tmp.path());
    let (session, _rx) = session_with(&agent_config(vec![]));

    let result = agents
        .run(&session, "planner", prompt_args("plan my day"), CallOptions::default())
        .await
        .unwrap();

    assert!(!result.is_error);
    assert_eq!(result.content[0].as_text(), Some("All planned."));
    assert_eq!(result.agent, "planner");
    assert_eq!(result.stop_reason, "end_turn");
}

#[tokio::test]
async fn unknown_agent_errors() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (agents, _runtime) = engine(MockCompleter::with_text("x"), tmp.path());
    let (session, _rx) = session_with(&Config::default());

    let err = agents
        .run(&session, "ghost", prompt_args("hi"), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::AgentNotDefined(_)));
}

#[tokio::test]
async fn tool_calls_execute_and_feed_back() {
    let tmp = tempfile::TempDir::new().unwrap();
    let completer = MockCompleter::new(vec![
        MockOutcome::Response(MockCompleter::tool_call_response(vec![(
            "c1",
            "read",
            json!({"path": "notes.txt"}),
        )])),
        MockOutcome::Response(MockCompleter::text_response("The file says: file contents")),
    ]);
    let (agents, _runtime) = engine(completer, tmp.path());

    let (session, _rx) = session_with(&agent_config(vec!["files".to_string()]));
    session.set(AUTO_APPROVE_SESSION_KEY, &true);

    let result = agents
        .run(&session, "planner", prompt_args("read my notes"), CallOptions::default())
        .await
        .unwrap();

    assert_eq!(
        result.content[0].as_text(),
        Some("The file says: file contents")
    );
}

#[tokio::test]
async fn second_turn_sees_tool_results() {
    let tmp = tempfile::TempDir::new().unwrap();
    let completer = MockCompleter::new(vec![
        MockOutcome::Response(MockCompleter::tool_call_response(vec![(
            "c1",
            "read",
            json!({}),
        )])),
        MockOutcome::Response(MockCompleter::text_response("done")),
    ]);
    let runtime = Arc::new(Runtime::new(Arc::new(OneToolConnector {
        tool: "read",
        payload: "file contents".to_string(),
    })));
    let completer = Arc::new(completer);
    let agents = Agents::new(runtime.clone(), completer.clone()).with_workspace_root(tmp.path());

    let (session, _rx) = session_with(&agent_config(vec!["files".to_string()]));
    session.set(AUTO_APPROVE_SESSION_KEY, &true);

    agents
        .run(&session, "planner", prompt_args("go"), CallOptions::default())
        .await
        .unwrap();

    let requests = completer.requests();
    assert_eq!(requests.len(), 2);

    // Second request: original user message, assistant plan, tool results.
    let second = &requests[1];
    assert_eq!(second.input.len(), 3);
    assert!(second.input[1].tool_calls().next().is_some());
    let result_item = &second.input[2].items[0];
    let output = &result_item.tool_call_result.as_ref().unwrap().output;
    assert_eq!(output.content[0].as_text(), Some("file contents"));

    // System prompt and tools flowed from the agent config.
    assert_eq!(second.system_prompt, "You plan things.");
    assert!(second.tools.iter().any(|t| t.name == "read"));
    assert_eq!(second.model, "test-model");
}

#[tokio::test]
async fn oversized_tool_results_truncate_inside_the_loop() {
    let tmp = tempfile::TempDir::new().unwrap();
    let completer = MockCompleter::new(vec![
        MockOutcome::Response(MockCompleter::tool_call_response(vec![(
            "big-call",
            "read",
            json!({}),
        )])),
        MockOutcome::Response(MockCompleter::text_response("done")),
    ]);
    let runtime = Arc::new(Runtime::new(Arc::new(OneToolConnector {
        tool: "read",
        payload: "X".repeat(60_000),
    })));
    let completer = Arc::new(completer);
    let agents = Agents::new(runtime, completer.clone()).with_workspace_root(tmp.path());

    let (session, _rx) = session_with(&agent_config(vec!["files".to_string()]));
    session.set(AUTO_APPROVE_SESSION_KEY, &true);

    agents
        .run(&session, "planner", prompt_args("read it all"), CallOptions::default())
        .await
        .unwrap();

    // The model saw the truncated form.
    let second = &completer.requests()[1];
    let output = &second.input[2].items[0].tool_call_result.as_ref().unwrap().output;
    let total: usize = output.content.iter().map(|c| c.byte_size()).sum();
    assert!(total <= nanobot_agent::MAX_TOOL_RESULT_SIZE);
    let pointer = output.content.last().unwrap().as_text().unwrap();
    assert!(pointer.contains("truncated-outputs/read-big-call.txt"));

    // The full payload is on disk.
    let spilled = tmp
        .path()
        .join(".nanobot/sess-agent/truncated-outputs/read-big-call.txt");
    assert_eq!(std::fs::read_to_string(spilled).unwrap().len(), 60_000);
}

#[tokio::test]
async fn turn_limit_bounds_runaway_plans() {
    let tmp = tempfile::TempDir::new().unwrap();
    // Each turn plans a fresh call so the loop never terminates on its own.
    let ids = ["c0", "c1", "c2", "c3", "c4", "c5", "c6", "c7", "c8", "c9"];
    let outcomes: Vec<MockOutcome> = ids
        .iter()
        .map(|id| {
            MockOutcome::Response(MockCompleter::tool_call_response(vec![(
                *id,
                "read",
                json!({}),
            )]))
        })
        .collect();
    let (agents, _runtime) = engine(MockCompleter::new(outcomes), tmp.path());
    let agents = agents.with_max_turns(3);

    let (session, _rx) = session_with(&agent_config(vec!["files".to_string()]));
    session.set(AUTO_APPROVE_SESSION_KEY, &true);

    let err = agents
        .run(&session, "planner", prompt_args("loop forever"), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::TurnLimitExceeded(3)));
}

#[tokio::test]
async fn cancellation_mid_stream_yields_synthetic_message() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (agents, _runtime) = engine(
        MockCompleter::new(vec![MockOutcome::HangUntilCancelled]),
        tmp.path(),
    );
    let (session, mut rx) = session_with(&agent_config(vec![]));

    let cancel = CancellationToken::new();
    let run = {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            agents
                .run(
                    &session,
                    "planner",
                    prompt_args("never finishes"),
                    CallOptions {
                        abort: Some(cancel),
                        progress_token: Some(json!("tok-1")),
                        ..Default::default()
                    },
                )
                .await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    cancel.cancel();

    let result = run.await.unwrap().unwrap();
    let text = result.content[0].as_text().unwrap();
    assert!(text.starts_with("REQUEST CANCELLED:"));
    assert_eq!(result.stop_reason, "cancelled");

    // The terminal message also went out as progress for the token.
    let mut saw_cancelled_progress = false;
    while let Ok(msg) = rx.try_recv() {
        if msg.method.as_deref() == Some("notifications/progress") {
            let text = msg.params.unwrap().to_string();
            if text.contains("REQUEST CANCELLED:") {
                saw_cancelled_progress = true;
            }
        }
    }
    assert!(saw_cancelled_progress);
}

#[tokio::test]
async fn confirmation_rejection_replaces_dispatch() {
    let tmp = tempfile::TempDir::new().unwrap();
    let completer = MockCompleter::new(vec![
        MockOutcome::Response(MockCompleter::tool_call_response(vec![(
            "c1",
            "read",
            json!({}),
        )])),
        MockOutcome::Response(MockCompleter::text_response("understood")),
    ]);
    let runtime = Arc::new(Runtime::new(Arc::new(OneToolConnector {
        tool: "read",
        payload: "secret".to_string(),
    })));
    let completer = Arc::new(completer);
    let agents = Agents::new(runtime, completer.clone()).with_workspace_root(tmp.path());

    let (session, mut rx) = session_with(&agent_config(vec!["files".to_string()]));

    let run = {
        let session = session.clone();
        tokio::spawn(async move {
            agents
                .run(&session, "planner", prompt_args("try it"), CallOptions::default())
                .await
        })
    };

    // The confirmation elicitation arrives; reject it.
    let elicitation = loop {
        let msg = rx.recv().await.unwrap();
        if msg.method.as_deref() == Some("elicitation/create") {
            break msg;
        }
    };
    session
        .accept(Message::response(
            elicitation.id.clone().unwrap(),
            json!({"action": "reject"}),
        ))
        .unwrap();

    run.await.unwrap().unwrap();

    // The model received the rejection, not the tool output.
    let second = &completer.requests()[1];
    let output = &second.input[2].items[0].tool_call_result.as_ref().unwrap().output;
    assert!(output.is_error);
    assert!(output.content[0].as_text().unwrap().contains("declined"));
}

#[tokio::test]
async fn compaction_triggers_on_small_context_window() {
    let tmp = tempfile::TempDir::new().unwrap();
    let completer = Arc::new(MockCompleter::new(vec![
        // First call is the summarizer, then the actual completion.
        MockOutcome::Response(MockCompleter::text_response("Condensed history.")),
        MockOutcome::Response(MockCompleter::text_response("answered")),
    ]));
    let runtime = Arc::new(Runtime::new(Arc::new(OneToolConnector {
        tool: "read",
        payload: String::new(),
    })));
    let agents = Agents::new(runtime, completer.clone()).with_workspace_root(tmp.path());

    let mut config = Config::default();
    config.agents.insert(
        "planner".to_string(),
        AgentConfig {
            model: "test-model".to_string(),
            context_window: Some(10_000),
            ..Default::default()
        },
    );
    let (session, _rx) = session_with(&config);

    // Preload history estimated at ~8600 tokens, above 0.835 × 10_000.
    let history = vec![nanobot_types::ChatMessage::user_text("h".repeat(8_600 * 4))];
    session.set("agent/planner/history", &history);

    let result = agents
        .run(&session, "planner", prompt_args("latest question"), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result.content[0].as_text(), Some("answered"));

    // The completion request contained exactly one compaction summary and
    // not the raw history.
    let requests = completer.requests();
    assert_eq!(requests.len(), 2);
    let completion = &requests[1];
    let summaries = completion
        .input
        .iter()
        .filter(|m| m.is_compaction_summary())
        .count();
    assert_eq!(summaries, 1);
    assert!(completion.input[0].text_content().contains("Condensed history."));
    assert!(!completion.input.iter().any(|m| m.text_content().starts_with("hhhh")));

    // The archived history is retained for auditing.
    let archived: Vec<nanobot_types::ChatMessage> =
        session.get("agent/planner/archive").unwrap();
    assert_eq!(archived.len(), 1);
}
