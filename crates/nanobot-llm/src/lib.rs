//! The abstract completer contract for nanobot.
//!
//! Concrete LLM vendors live behind the [`Completer`] trait; the core only
//! depends on this crate. The [`MockCompleter`] returns scripted responses
//! in order and records every request, which is what the agent-loop tests
//! drive.

mod completer;
mod error;

pub use completer::{
    CompletionOptions, Completer, MockCompleter, MockOutcome, ProgressSink, SharedCompleter,
    send_progress,
};
pub use error::{LlmError, Result};
