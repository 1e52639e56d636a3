//! The per-session event log behind the SSE stream.
//!
//! Every server-to-client payload becomes an [`SessionEvent`] with a
//! monotonically increasing ID scoped to the session. A bounded replay
//! buffer serves reconnections (`Last-Event-ID`); live subscribers receive
//! events through a broadcast channel in FIFO order.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::broadcast;

/// Default number of events retained for replay.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1024;

/// Named out-of-band event types, alongside the `message` event that carries
/// JSON-RPC payloads.
pub mod names {
    pub const MESSAGE: &str = "message";
    pub const HISTORY_START: &str = "history-start";
    pub const HISTORY_END: &str = "history-end";
    pub const CHAT_IN_PROGRESS: &str = "chat-in-progress";
    pub const CHAT_DONE: &str = "chat-done";
    pub const ELICITATION_CREATE: &str = "elicitation/create";
    pub const ERROR: &str = "error";
}

/// One event on a session's stream.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// Monotonic per-stream ID.
    pub id: u64,
    /// Event type.
    pub event: String,
    /// JSON payload.
    pub data: Value,
}

struct LogState {
    next_id: u64,
    buffer: VecDeque<SessionEvent>,
    capacity: usize,
}

/// The session-scoped event log.
pub struct EventLog {
    state: Mutex<LogState>,
    live: broadcast::Sender<SessionEvent>,
}

impl EventLog {
    /// Create a log with the default replay capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Create a log retaining up to `capacity` events for replay.
    pub fn with_capacity(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(LogState {
                next_id: 1,
                buffer: VecDeque::with_capacity(capacity.min(64)),
                capacity,
            }),
            live,
        }
    }

    /// Append an event and fan it out to live subscribers. Returns the
    /// assigned ID.
    pub fn publish(&self, event: &str, data: Value) -> u64 {
        let event = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let id = state.next_id;
            state.next_id += 1;

            let event = SessionEvent {
                id,
                event: event.to_string(),
                data,
            };
            if state.buffer.len() >= state.capacity {
                state.buffer.pop_front();
            }
            state.buffer.push_back(event.clone());
            event
        };

        let id = event.id;
        let _ = self.live.send(event);
        id
    }

    /// Buffered events with IDs greater than `after`.
    pub fn replay(&self, after: u64) -> Vec<SessionEvent> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .buffer
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .collect()
    }

    /// Subscribe to live events. Combine with [`EventLog::replay`] for
    /// resume semantics.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.live.subscribe()
    }

    /// The highest assigned event ID so far.
    pub fn last_id(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_id - 1
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_monotonic() {
        let log = EventLog::new();
        let a = log.publish(names::MESSAGE, json!({"n": 1}));
        let b = log.publish(names::MESSAGE, json!({"n": 2}));
        let c = log.publish(names::CHAT_DONE, json!({}));
        assert!(a < b && b < c);
        assert_eq!(log.last_id(), c);
    }

    #[test]
    fn replay_filters_by_id() {
        let log = EventLog::new();
        for n in 0..5 {
            log.publish(names::MESSAGE, json!({"n": n}));
        }

        let replayed = log.replay(2);
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].id, 3);
        assert_eq!(replayed[2].id, 5);

        assert!(log.replay(5).is_empty());
        assert_eq!(log.replay(0).len(), 5);
    }

    #[test]
    fn bounded_buffer_drops_oldest() {
        let log = EventLog::with_capacity(3);
        for n in 0..10 {
            log.publish(names::MESSAGE, json!({"n": n}));
        }

        let replayed = log.replay(0);
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].id, 8);
        assert_eq!(replayed[2].id, 10);
    }

    #[tokio::test]
    async fn live_subscribers_see_fifo_order() {
        let log = EventLog::new();
        let mut rx = log.subscribe();

        log.publish(names::MESSAGE, json!({"n": 1}));
        log.publish(names::ERROR, json!({"oops": true}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event, names::MESSAGE);
        assert_eq!(second.event, names::ERROR);
        assert!(first.id < second.id);
    }
}
