//! Integration tests driving an [`McpClient`] against a scripted in-memory
//! upstream server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nanobot_mcp::{CallOptions, ClientState, McpClient, McpError, Transport};
use nanobot_types::{Message, ProgressParams, RequestId};

/// A minimal scripted MCP server living on the far side of a transport pair.
struct MockServer {
    requests: Arc<tokio::sync::Mutex<Vec<Message>>>,
    cancelled: Arc<AtomicUsize>,
}

impl MockServer {
    /// Spawn the server; returns the client-side transport.
    fn spawn(slow_tool: bool) -> (Transport, MockServer) {
        let (client_side, server_side) = Transport::pair();
        let requests = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let cancelled = Arc::new(AtomicUsize::new(0));

        let server = MockServer {
            requests: requests.clone(),
            cancelled: cancelled.clone(),
        };

        tokio::spawn(async move {
            let mut inbound = server_side.take_inbound().await.unwrap();
            while let Some(msg) = inbound.recv().await {
                requests.lock().await.push(msg.clone());

                if msg.method.as_deref() == Some("notifications/cancelled") {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                    continue;
                }

                let Some(id) = msg.id.clone() else { continue };
                let reply = match msg.method.as_deref() {
                    Some("initialize") => json!({
                        "protocolVersion": "2025-06-18",
                        "capabilities": {
                            "tools": {},
                            "resources": {"subscribe": true, "listChanged": true}
                        },
                        "serverInfo": {"name": "mock-upstream", "version": "1.0.0"}
                    }),
                    Some("tools/list") => json!({
                        "tools": [{"name": "echo", "description": "Echo the input"}]
                    }),
                    Some("tools/call") => {
                        if slow_tool {
                            // Never reply; the caller exercises cancellation.
                            continue;
                        }
                        let token = msg.progress_token();
                        if let Some(token) = token {
                            let progress = Message::notification(
                                "notifications/progress",
                                Some(json!({"progressToken": token, "progress": 0.5})),
                            );
                            let _ = server_side.send(progress).await;
                        }
                        json!({"content": [{"type": "text", "text": "echoed"}]})
                    }
                    Some("resources/subscribe") => json!({}),
                    Some("ping") => json!({}),
                    Some(other) => {
                        let err = nanobot_types::RpcError::method_not_found(other);
                        let _ = server_side.send(Message::error_response(id, err)).await;
                        continue;
                    }
                    None => continue,
                };
                let _ = server_side.send(Message::response(id, reply)).await;
            }
        });

        (client_side, server)
    }

    async fn methods(&self) -> Vec<String> {
        self.requests
            .lock()
            .await
            .iter()
            .filter_map(|m| m.method.clone())
            .collect()
    }
}

#[tokio::test]
async fn initialize_handshake_records_result() {
    let (transport, server) = MockServer::spawn(false);
    let client = McpClient::connect("up", transport).await.unwrap();
    assert_eq!(client.state(), ClientState::Init);

    let init = client.initialize().await.unwrap();
    assert_eq!(init.server_info.name, "mock-upstream");
    assert_eq!(client.state(), ClientState::Ready);
    assert!(client.supports_resource_subscribe());

    // initialize, then notifications/initialized, in that order.
    tokio::task::yield_now().await;
    let methods = server.methods().await;
    assert_eq!(methods[0], "initialize");
    assert_eq!(methods[1], "notifications/initialized");
}

#[tokio::test]
async fn requests_wait_for_handshake() {
    let (transport, _server) = MockServer::spawn(false);
    let client = McpClient::connect("up", transport).await.unwrap();

    // Start the list before initializing; it must resolve once the
    // handshake lands.
    let lister = {
        let client = client.clone();
        tokio::spawn(async move { client.list_tools().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    client.initialize().await.unwrap();

    let tools = lister.await.unwrap().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
}

#[tokio::test]
async fn call_tool_routes_progress_to_sink() {
    let (transport, _server) = MockServer::spawn(false);
    let client = McpClient::connect("up", transport).await.unwrap();
    client.initialize().await.unwrap();

    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressParams>(8);
    let result = client
        .call_tool(
            "echo",
            None,
            CallOptions {
                progress_token: Some(Value::String("tok-1".to_string())),
                progress: Some(progress_tx),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!result.is_error());
    let progress = progress_rx.recv().await.unwrap();
    assert_eq!(progress.progress_token, json!("tok-1"));
    assert!((progress.progress - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn cancellation_notifies_peer() {
    let (transport, server) = MockServer::spawn(true);
    let client = McpClient::connect("up", transport).await.unwrap();
    client.initialize().await.unwrap();

    let abort = CancellationToken::new();
    let call = {
        let client = client.clone();
        let abort = abort.clone();
        tokio::spawn(async move {
            client
                .call_tool(
                    "echo",
                    None,
                    CallOptions {
                        abort: Some(abort),
                        ..Default::default()
                    },
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    abort.cancel();

    assert!(matches!(call.await.unwrap(), Err(McpError::Cancelled)));

    // The peer received notifications/cancelled for the in-flight call.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.cancelled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn peer_errors_surface() {
    let (transport, _server) = MockServer::spawn(false);
    let client = McpClient::connect("up", transport).await.unwrap();
    client.initialize().await.unwrap();

    let err = client
        .exchange("prompts/list", json!({}), CallOptions::default())
        .await
        .unwrap_err();
    match err {
        McpError::Peer(rpc) => assert_eq!(rpc.code, nanobot_types::RpcError::METHOD_NOT_FOUND),
        other => panic!("expected peer error, got {other:?}"),
    }
}

#[tokio::test]
async fn transport_drop_fails_pending_and_closes() {
    let (client_side, server_side) = Transport::pair();
    let mut server_inbound = server_side.take_inbound().await.unwrap();

    let client = McpClient::connect("up", client_side).await.unwrap();

    let init = {
        let client = client.clone();
        tokio::spawn(async move { client.initialize().await })
    };

    // Swallow the initialize request, then hang up.
    let _ = server_inbound.recv().await.unwrap();
    drop(server_inbound);
    drop(server_side);

    assert!(matches!(init.await.unwrap(), Err(McpError::TransportClosed)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.state(), ClientState::Closed);
}

#[tokio::test]
async fn close_is_idempotent() {
    let (transport, _server) = MockServer::spawn(false);
    let client = McpClient::connect("up", transport).await.unwrap();
    client.initialize().await.unwrap();

    client.close(true);
    client.close(true);
    client.close(false);
    assert_eq!(client.state(), ClientState::Closed);

    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, McpError::Closed));
}

#[tokio::test]
async fn notifications_fan_out_to_handler() {
    let (client_side, server_side) = Transport::pair();
    let _server_inbound = server_side.take_inbound().await.unwrap();

    let client = McpClient::connect("up", client_side).await.unwrap();
    let (seen_tx, mut seen_rx) = mpsc::channel::<Message>(4);
    client.on_notification(Arc::new(move |msg| {
        let _ = seen_tx.try_send(msg);
    }));

    server_side
        .send(Message::notification(
            "notifications/resources/updated",
            Some(json!({"uri": "file:///a.txt"})),
        ))
        .await
        .unwrap();

    let seen = seen_rx.recv().await.unwrap();
    assert_eq!(seen.method.as_deref(), Some("notifications/resources/updated"));
}

#[tokio::test]
async fn request_ids_are_monotonic() {
    let (transport, server) = MockServer::spawn(false);
    let client = McpClient::connect("up", transport).await.unwrap();
    client.initialize().await.unwrap();
    client.ping().await.unwrap();
    client.ping().await.unwrap();

    let requests = server.requests.lock().await;
    let ids: Vec<i64> = requests
        .iter()
        .filter_map(|m| match &m.id {
            Some(RequestId::Number(n)) => Some(*n),
            _ => None,
        })
        .collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(ids.len(), sorted.len(), "ids must not repeat: {ids:?}");
}
