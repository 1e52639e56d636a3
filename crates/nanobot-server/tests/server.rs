//! End-to-end tests: a full aggregator stack over scripted upstreams and a
//! scripted completer, driven through the inbound pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use nanobot_agent::Agents;
use nanobot_llm::{MockCompleter, MockOutcome};
use nanobot_mcp::Transport;
use nanobot_runtime::{Connector, RequestContext, Runtime, RuntimeError, SessionData};
use nanobot_server::{AppState, InMemoryThreadStore, McpServer, SessionHandle, names};
use nanobot_session::Session;
use nanobot_types::{AgentConfig, Config, EnvDef, McpServerDef, Message, RpcError};

/// An upstream with one tool, one resource, and subscribe support. Tests
/// can push notifications to every connected client through the hub.
struct HubConnector {
    hub: broadcast::Sender<Message>,
}

impl HubConnector {
    fn new() -> (Self, broadcast::Sender<Message>) {
        let (hub, _) = broadcast::channel(64);
        (Self { hub: hub.clone() }, hub)
    }
}

#[async_trait]
impl Connector for HubConnector {
    async fn connect(
        &self,
        _server: &str,
        _def: &McpServerDef,
        _session: &Session,
    ) -> Result<Transport, RuntimeError> {
        let (client_side, server_side) = Transport::pair();
        let mut hub = self.hub.subscribe();

        tokio::spawn(async move {
            let mut inbound = server_side.take_inbound().await.unwrap();
            loop {
                tokio::select! {
                    pushed = hub.recv() => {
                        match pushed {
                            Ok(msg) => {
                                if server_side.send(msg).await.is_err() {
                                    return;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                            Err(_) => {}
                        }
                    }
                    msg = inbound.recv() => {
                        let Some(msg) = msg else { return };
                        let Some(id) = msg.id.clone() else { continue };
                        let reply = match msg.method.as_deref() {
                            Some("initialize") => json!({
                                "protocolVersion": "2025-06-18",
                                "capabilities": {
                                    "tools": {},
                                    "resources": {"subscribe": true, "listChanged": true}
                                },
                                "serverInfo": {"name": "files-upstream", "version": "2.1.0"}
                            }),
                            Some("tools/list") => json!({"tools": [{"name": "read"}]}),
                            Some("tools/call") => json!({
                                "content": [{"type": "text", "text": "read ok"}]
                            }),
                            Some("resources/list") => json!({
                                "resources": [{"uri": "file:///a.txt", "name": "a"}]
                            }),
                            Some("resources/templates/list") => json!({"resourceTemplates": []}),
                            Some("resources/subscribe") | Some("resources/unsubscribe") => json!({}),
                            _ => json!({}),
                        };
                        if server_side.send(Message::response(id, reply)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(client_side)
    }
}

struct Stack {
    state: AppState,
    hub: broadcast::Sender<Message>,
}

fn build_stack(config: Config, completer: Option<MockCompleter>) -> Stack {
    let (connector, hub) = HubConnector::new();
    let runtime = Arc::new(Runtime::new(Arc::new(connector)));
    if let Some(completer) = completer {
        let agents = Agents::new(runtime.clone(), Arc::new(completer));
        runtime.set_agent_invoker(Arc::new(agents));
    }

    let data = SessionData::new(runtime);
    let factory: nanobot_runtime::ConfigFactory = Arc::new(move |_s| Ok(config.clone()));
    let server = McpServer::new(data, factory);
    let state = AppState::new(server, Arc::new(InMemoryThreadStore::new()));

    Stack { state, hub }
}

fn files_config() -> Config {
    let mut config = Config::default();
    config.publish.name = "nanobot".to_string();
    config.publish.version = "1.0.0".to_string();
    config.publish.mcp_servers = vec!["files".to_string()];
    config.publish.entrypoint = vec!["planner".to_string()];
    config.agents.insert(
        "planner".to_string(),
        AgentConfig {
            model: "test-model".to_string(),
            ..Default::default()
        },
    );
    config
        .mcp_servers
        .insert("files".to_string(), McpServerDef::default());
    config
}

fn send(stack: &Stack, handle: &SessionHandle, msg: Value) {
    stack.state.handle_inbound(
        handle,
        RequestContext::default(),
        None,
        &msg.to_string(),
    );
}

/// Wait for the next `message` event matching the predicate.
async fn next_message(
    rx: &mut broadcast::Receiver<nanobot_server::SessionEvent>,
    mut predicate: impl FnMut(&Value) -> bool,
) -> Value {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if event.event == names::MESSAGE && predicate(&event.data) {
            return event.data;
        }
    }
}

#[tokio::test]
async fn missing_env_surfaces_on_initialize() {
    let mut config = files_config();
    config.env.insert(
        "OPENAI_API_KEY".to_string(),
        EnvDef {
            description: "OpenAI API key".to_string(),
            ..Default::default()
        },
    );
    let stack = build_stack(config, None);

    let handle = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut rx = handle.events.subscribe();

    send(
        &stack,
        &handle,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
               "params": {"protocolVersion": "2025-06-18"}}),
    );

    let reply = next_message(&mut rx, |m| m["id"] == 1).await;
    assert_eq!(reply["error"]["code"], -32602);
    let missing = &reply["error"]["data"]["missingEnv"];
    assert_eq!(missing[0]["name"], "OPENAI_API_KEY");
    assert_eq!(missing[0]["description"], "OpenAI API key");
}

#[tokio::test]
async fn initialize_synthesizes_unified_surface() {
    let stack = build_stack(files_config(), None);
    let handle = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut rx = handle.events.subscribe();

    send(
        &stack,
        &handle,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
               "params": {"protocolVersion": "2025-06-18"}}),
    );

    let reply = next_message(&mut rx, |m| m["id"] == 1).await;
    let result = &reply["result"];
    assert_eq!(result["protocolVersion"], "2025-06-18");
    assert_eq!(result["serverInfo"]["name"], "nanobot");
    assert_eq!(result["capabilities"]["resources"]["subscribe"], true);
    assert_eq!(result["capabilities"]["resources"]["listChanged"], true);
    assert!(result["capabilities"]["logging"].is_object());
}

#[tokio::test]
async fn single_server_proxy_forwards_upstream_initialize() {
    let mut config = Config::default();
    config.publish.mcp_servers = vec!["files".to_string()];
    config
        .mcp_servers
        .insert("files".to_string(), McpServerDef::default());
    let stack = build_stack(config, None);

    let handle = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut rx = handle.events.subscribe();

    send(
        &stack,
        &handle,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
               "params": {"protocolVersion": "2025-06-18"}}),
    );

    let reply = next_message(&mut rx, |m| m["id"] == 1).await;
    // Verbatim upstream result: its serverInfo and capabilities, not ours.
    assert_eq!(reply["result"]["serverInfo"]["name"], "files-upstream");
    assert_eq!(reply["result"]["serverInfo"]["version"], "2.1.0");
}

#[tokio::test]
async fn tools_list_includes_agents_and_upstream_tools() {
    let stack = build_stack(files_config(), None);
    let handle = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut rx = handle.events.subscribe();

    send(&stack, &handle, json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}));

    let reply = next_message(&mut rx, |m| m["id"] == 1).await;
    let names: Vec<&str> = reply["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"chat-with-planner"));
    assert!(names.contains(&"read"));
    // Sorted published order.
    let mut sorted = names.clone();
    sorted.sort_unstable();
    assert_eq!(names, sorted);
}

#[tokio::test]
async fn tools_call_dispatches_to_upstream() {
    let stack = build_stack(files_config(), None);
    let handle = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut rx = handle.events.subscribe();

    send(
        &stack,
        &handle,
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
               "params": {"name": "read", "arguments": {"path": "a.txt"}}}),
    );

    let reply = next_message(&mut rx, |m| m["id"] == 2).await;
    assert_eq!(reply["result"]["isError"], false);
    assert_eq!(reply["result"]["content"][0]["text"], "read ok");
}

#[tokio::test]
async fn unknown_tool_fails_after_one_refresh() {
    let stack = build_stack(files_config(), None);
    let handle = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut rx = handle.events.subscribe();

    send(
        &stack,
        &handle,
        json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "nope"}}),
    );

    let reply = next_message(&mut rx, |m| m["id"] == 3).await;
    assert_eq!(reply["error"]["code"], RpcError::TOOL_NOT_FOUND);
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let stack = build_stack(files_config(), None);
    let handle = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut rx = handle.events.subscribe();

    send(&stack, &handle, json!({"jsonrpc": "2.0", "id": 9, "method": "tools/destroy"}));

    let reply = next_message(&mut rx, |m| m["id"] == 9).await;
    assert_eq!(reply["error"]["code"], RpcError::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn ping_replies_empty() {
    let stack = build_stack(files_config(), None);
    let handle = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut rx = handle.events.subscribe();

    send(&stack, &handle, json!({"jsonrpc": "2.0", "id": 4, "method": "ping"}));
    let reply = next_message(&mut rx, |m| m["id"] == 4).await;
    assert_eq!(reply["result"], json!({}));
}

#[tokio::test]
async fn resource_subscription_isolates_sessions() {
    let stack = build_stack(files_config(), None);

    let a = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let b = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut a_rx = a.events.subscribe();
    let mut b_rx = b.events.subscribe();

    // Both sessions touch the upstream so both have live clients and the
    // subscription filter installed.
    send(&stack, &a, json!({"jsonrpc": "2.0", "id": 1, "method": "resources/list"}));
    send(&stack, &b, json!({"jsonrpc": "2.0", "id": 1, "method": "resources/list"}));
    next_message(&mut a_rx, |m| m["id"] == 1).await;
    next_message(&mut b_rx, |m| m["id"] == 1).await;

    // Only A subscribes.
    send(
        &stack,
        &a,
        json!({"jsonrpc": "2.0", "id": 2, "method": "resources/subscribe",
               "params": {"uri": "file:///a.txt"}}),
    );
    next_message(&mut a_rx, |m| m["id"] == 2).await;

    // The upstream announces a change to every connected client.
    stack
        .hub
        .send(Message::notification(
            "notifications/resources/updated",
            Some(json!({"uri": "file:///a.txt"})),
        ))
        .unwrap();

    // A receives it exactly once.
    let update = next_message(&mut a_rx, |m| {
        m["method"] == "notifications/resources/updated"
    })
    .await;
    assert_eq!(update["params"]["uri"], "file:///a.txt");

    // B receives nothing for the URI.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = b_rx.try_recv() {
        assert_ne!(
            event.data["method"], "notifications/resources/updated",
            "unsubscribed session must not see the update"
        );
    }
}

#[tokio::test]
async fn read_resource_resolves_through_mappings() {
    let stack = build_stack(files_config(), None);
    let handle = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut rx = handle.events.subscribe();

    send(
        &stack,
        &handle,
        json!({"jsonrpc": "2.0", "id": 5, "method": "resources/read",
               "params": {"uri": "file:///missing"}}),
    );
    let reply = next_message(&mut rx, |m| m["id"] == 5).await;
    assert_eq!(reply["error"]["code"], RpcError::RESOURCE_NOT_FOUND);
}

#[tokio::test]
async fn cancellation_during_agent_turn() {
    let completer = MockCompleter::new(vec![MockOutcome::HangUntilCancelled]);
    let stack = build_stack(files_config(), Some(completer));

    let handle = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut rx = handle.events.subscribe();

    send(
        &stack,
        &handle,
        json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call",
               "params": {
                   "name": "chat-with-planner",
                   "arguments": {"prompt": "think forever"},
                   "_meta": {"progressToken": "tok-7"}
               }}),
    );

    // Give the run a moment to reach the completer, then cancel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    send(
        &stack,
        &handle,
        json!({"jsonrpc": "2.0", "method": "notifications/cancelled",
               "params": {"requestId": 7, "reason": "user clicked stop"}}),
    );

    // The terminal progress event carries the synthetic assistant message.
    let progress = next_message(&mut rx, |m| {
        m["method"] == "notifications/progress"
            && m["params"].to_string().contains("REQUEST CANCELLED")
    })
    .await;
    assert!(progress["params"].to_string().contains("user clicked stop"));

    // The call itself resolves with the synthetic message, not an error.
    let reply = next_message(&mut rx, |m| m["id"] == 7).await;
    let text = reply["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.starts_with("REQUEST CANCELLED:"));
    assert!(text.contains("user clicked stop"));
}

#[tokio::test]
async fn chat_calls_bracket_with_named_events() {
    let completer = MockCompleter::with_text("done thinking");
    let stack = build_stack(files_config(), Some(completer));

    let handle = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut rx = handle.events.subscribe();

    send(
        &stack,
        &handle,
        json!({"jsonrpc": "2.0", "id": 8, "method": "tools/call",
               "params": {"name": "chat-with-planner", "arguments": {"prompt": "hi"}}}),
    );

    let mut saw_in_progress = false;
    let mut saw_done = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("closed");
        match event.event.as_str() {
            names::CHAT_IN_PROGRESS => saw_in_progress = true,
            names::CHAT_DONE => {
                saw_done = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_in_progress && saw_done);
}

#[tokio::test]
async fn duplicate_request_ids_are_rejected() {
    let completer = MockCompleter::new(vec![
        MockOutcome::HangUntilCancelled,
        MockOutcome::Response(MockCompleter::text_response("late")),
    ]);
    let stack = build_stack(files_config(), Some(completer));

    let handle = stack
        .state
        .get_or_create_session(None, &RequestContext::default());
    let mut rx = handle.events.subscribe();

    let call = json!({"jsonrpc": "2.0", "id": 11, "method": "tools/call",
                      "params": {"name": "chat-with-planner", "arguments": {"prompt": "x"}}});
    send(&stack, &handle, call.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    send(&stack, &handle, call);

    // The second use of the in-flight ID fails immediately.
    let reply = next_message(&mut rx, |m| m["id"] == 11 && m["error"].is_object()).await;
    assert_eq!(reply["error"]["code"], RpcError::INVALID_REQUEST);
    assert!(
        reply["error"]["message"]
            .as_str()
            .unwrap()
            .contains("duplicate request id")
    );

    // Unwedge the first call.
    send(
        &stack,
        &handle,
        json!({"jsonrpc": "2.0", "method": "notifications/cancelled",
               "params": {"requestId": 11, "reason": "cleanup"}}),
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP surface
// ─────────────────────────────────────────────────────────────────────────────

mod http {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use nanobot_server::Server;
    use tower::ServiceExt;

    #[tokio::test]
    async fn post_accepts_and_assigns_session() {
        let stack = build_stack(files_config(), None);
        let app = Server::new(stack.state.clone()).router();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let session_id = response
            .headers()
            .get("Mcp-Session-Id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(stack.state.session(&session_id).is_some());
    }

    #[tokio::test]
    async fn post_reuses_session_header() {
        let stack = build_stack(files_config(), None);
        let app = Server::new(stack.state.clone()).router();
        let handle = stack
            .state
            .get_or_create_session(None, &RequestContext::default());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("Mcp-Session-Id", handle.session.id())
                    .body(Body::from(
                        json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("Mcp-Session-Id").unwrap(),
            handle.session.id()
        );
    }

    #[tokio::test]
    async fn events_endpoint_streams_sse() {
        let stack = build_stack(files_config(), None);
        let app = Server::new(stack.state.clone()).router();
        let handle = stack
            .state
            .get_or_create_session(None, &RequestContext::default());

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/events/{}", handle.session.id()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
    }
}
