//! The nanobot aggregating MCP endpoint.
//!
//! One axum router exposes both framings over the same dispatch layer:
//!
//! - `GET /mcp` upgrades to a WebSocket carrying one JSON-RPC message per
//!   text frame.
//! - `POST /mcp` accepts one JSON-RPC message per request body (session
//!   affinity via the `Mcp-Session-Id` header) and answers `202 Accepted`;
//!   responses flow back over the event stream.
//! - `GET /api/events/{session_id}` opens the session-scoped SSE stream
//!   with `Last-Event-ID` resume.
//!
//! Authentication policy is delegated: a fronting proxy authenticates the
//! caller and asserts the account in the `X-Nanobot-Account` header.

pub mod audit;
pub mod error;
pub mod events;
pub mod handler;
pub mod state;
pub mod threads;

pub use audit::{AuditLog, Collector};
pub use error::{Result, ServerError};
pub use events::{EventLog, SessionEvent, names};
pub use handler::{BEARER_TOKEN_ENV_KEY, McpServer, ServerOptions, reconcile_env};
pub use state::{AppState, SessionHandle};
pub use threads::{InMemoryThreadStore, ThreadInfo, ThreadStore};

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use nanobot_runtime::RequestContext;

/// The aggregator's HTTP server.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a server over prepared state.
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/mcp", get(ws_handler).post(post_handler))
            .route("/api/events/{session_id}", get(events_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind and serve.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let router = self.router();
        tracing::info!(%addr, "starting nanobot server");

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Internal(format!("failed to bind: {e}")))?;
        axum::serve(listener, router)
            .await
            .map_err(|e| ServerError::Internal(format!("server error: {e}")))?;
        Ok(())
    }

    /// The shared state, for composing additional routes.
    pub fn state(&self) -> &AppState {
        &self.state
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request context
// ─────────────────────────────────────────────────────────────────────────────

fn request_context(headers: &HeaderMap, uri: &Uri) -> (RequestContext, Option<String>) {
    let scheme = header_str(headers, "x-forwarded-proto").unwrap_or("http");
    let host = header_str(headers, "x-forwarded-host")
        .or_else(|| header_str(headers, "host"))
        .unwrap_or("localhost");
    let public_url = format!("{scheme}://{host}{}", uri.path());

    let account_id = header_str(headers, "x-nanobot-account").map(str::to_string);
    let bearer = header_str(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    (
        RequestContext {
            account_id,
            public_url: Some(public_url),
            config: None,
        },
        bearer,
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket framing
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let (ctx, bearer) = request_context(&headers, &uri);
    ws.on_upgrade(move |socket| handle_socket(socket, state, ctx, bearer))
}

async fn handle_socket(socket: WebSocket, state: AppState, ctx: RequestContext, bearer: Option<String>) {
    let handle = state.get_or_create_session(None, &ctx);
    let session_id = handle.session.id().to_string();
    let mut events = handle.events.subscribe();
    let (mut sender, mut receiver) = socket.split();

    tracing::debug!(session_id = %session_id, "websocket connected");

    loop {
        tokio::select! {
            frame = receiver.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        state.handle_inbound(&handle, ctx.clone(), bearer.clone(), text.as_str());
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(session_id = %session_id, error = %e, "websocket error");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) if event.event == names::MESSAGE => {
                        if sender
                            .send(WsMessage::Text(event.data.to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(session_id = %session_id, skipped, "websocket subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    // The peer disconnected: in-flight exchanges complete with
    // TransportClosed and upstream clients close.
    state.close_session(&session_id);
    tracing::debug!(session_id = %session_id, "websocket disconnected");
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP + SSE framing
// ─────────────────────────────────────────────────────────────────────────────

async fn post_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    body: String,
) -> Response {
    let (ctx, bearer) = request_context(&headers, &uri);
    let session_id = header_str(&headers, "mcp-session-id");
    let handle = state.get_or_create_session(session_id, &ctx);

    state.handle_inbound(&handle, ctx, bearer, &body);

    (
        StatusCode::ACCEPTED,
        [("Mcp-Session-Id", handle.session.id().to_string())],
    )
        .into_response()
}

async fn events_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (ctx, _) = request_context(&headers, &uri);
    let handle = state.get_or_create_session(Some(&session_id), &ctx);

    let last_event_id: Option<u64> =
        header_str(&headers, "last-event-id").and_then(|v| v.parse().ok());

    // Subscribe before snapshotting the replay so nothing slips between.
    let live = handle.events.subscribe();
    let replay = handle.events.replay(last_event_id.unwrap_or(0));
    let resumed = last_event_id.is_some();

    let stream = async_stream::stream! {
        let mut max_seen = last_event_id.unwrap_or(0);

        // A fresh stream brackets its buffered history with named markers;
        // a resume just replays past the cursor.
        if !resumed {
            yield Ok(Event::default().event(names::HISTORY_START).data("{}"));
        }
        for event in replay {
            max_seen = event.id;
            yield Ok(to_sse_event(event));
        }
        if !resumed {
            yield Ok(Event::default().event(names::HISTORY_END).data("{}"));
        }

        let mut live = live;
        loop {
            match live.recv().await {
                Ok(event) => {
                    if event.id <= max_seen {
                        continue;
                    }
                    max_seen = event.id;
                    yield Ok(to_sse_event(event));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "sse subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: SessionEvent) -> Event {
    Event::default()
        .id(event.id.to_string())
        .event(&event.event)
        .data(event.data.to_string())
}
