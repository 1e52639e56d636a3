//! The nanobot agent completion loop.
//!
//! [`Agents`] drives multi-turn runs against the abstract completer: plan,
//! execute tool calls through the runtime, feed results back, repeat until
//! terminal. The supporting modules own per-result [`truncate`]-to-disk,
//! conversation [`compact`]ion, [`tokens`] estimation, and [`elicit`]ation
//! round-trips.

pub mod agent;
pub mod compact;
pub mod elicit;
pub mod error;
pub mod tokens;
pub mod truncate;

pub use agent::{Agents, DEFAULT_MAX_TURNS, REQUEST_ID_META_KEY};
pub use compact::{
    COMPACTION_THRESHOLD, CompactResult, DEFAULT_CONTEXT_WINDOW, compact, context_window_size,
    should_compact,
};
pub use elicit::{AUTO_APPROVE_SESSION_KEY, Confirmations, auto_answer};
pub use error::{AgentError, Result};
pub use tokens::{count_tokens, estimate_image_tokens, estimate_tokens};
pub use truncate::{MAX_TOOL_RESULT_SIZE, sanitize_path_component, truncate_tool_result};
