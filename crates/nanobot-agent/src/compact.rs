//! Conversation compaction.
//!
//! When the estimated token count of a populated request crosses the
//! threshold fraction of the context window, the history is summarized into
//! a single carry-forward message and the superseded messages move to the
//! archive. Re-compaction summarizes only the messages since the previous
//! summary, with that summary supplied as context, so the summarization
//! input stays bounded.

use serde_json::{Map, Value};
use uuid::Uuid;

use nanobot_llm::{CompletionOptions, Completer};
use nanobot_types::{
    COMPACTION_SUMMARY_META_KEY, ChatMessage, CompletionItem, CompletionRequest, Content,
};

use crate::error::{AgentError, Result};
use crate::tokens::estimate_tokens;

/// Fraction of the context window that triggers compaction.
pub const COMPACTION_THRESHOLD: f64 = 0.835;
/// Context window assumed when the agent config does not set one.
pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

/// The context window size, honoring a config override.
pub fn context_window_size(config_override: Option<usize>) -> usize {
    match config_override {
        Some(n) if n > 0 => n,
        _ => DEFAULT_CONTEXT_WINDOW,
    }
}

/// Whether the request's estimated tokens exceed the compaction threshold.
pub fn should_compact(request: &CompletionRequest, context_window: usize) -> bool {
    if context_window == 0 {
        return false;
    }
    let estimated = estimate_tokens(&request.input, &request.system_prompt, &request.tools);
    let threshold = (context_window as f64 * COMPACTION_THRESHOLD) as usize;
    estimated > threshold
}

/// Separate the populated input into history and new input by matching the
/// first message ID of the current request's input. When the boundary cannot
/// be found, everything is history.
pub fn split_history_and_new_input(
    full_input: &[ChatMessage],
    current_request_input: &[ChatMessage],
) -> (Vec<ChatMessage>, Vec<ChatMessage>) {
    let Some(first) = current_request_input.first() else {
        return (full_input.to_vec(), Vec::new());
    };

    for (i, msg) in full_input.iter().enumerate() {
        if msg.id == first.id {
            return (full_input[..i].to_vec(), full_input[i..].to_vec());
        }
    }

    (full_input.to_vec(), Vec::new())
}

/// The outcome of one compaction pass.
#[derive(Debug, Clone)]
pub struct CompactResult {
    /// The summary message followed by the new input.
    pub compacted_input: Vec<ChatMessage>,
    /// Everything superseded by the summary, appended to any prior archive.
    pub archived_messages: Vec<ChatMessage>,
}

/// Summarize the history of `request` and return the compacted input plus
/// the archive. `current_request_input` marks the history boundary;
/// `previous_compacted` is the archive accumulated by earlier compactions.
pub async fn compact(
    completer: &dyn Completer,
    request: &CompletionRequest,
    current_request_input: &[ChatMessage],
    previous_compacted: &[ChatMessage],
) -> Result<CompactResult> {
    let (history, new_input) = split_history_and_new_input(&request.input, current_request_input);

    // Only the messages after the previous summary need summarizing; the
    // summary itself becomes context for the next one.
    let mut previous_summary_text = String::new();
    let mut last_summary_idx = None;
    for (i, msg) in history.iter().enumerate() {
        if msg.is_compaction_summary() {
            last_summary_idx = Some(i);
            previous_summary_text = msg.text_content();
        }
    }
    let since_last_summary = match last_summary_idx {
        Some(i) => &history[i + 1..],
        None => &history[..],
    };

    let transcript = build_transcript(since_last_summary);
    let summary_prompt = if previous_summary_text.is_empty() {
        initial_compaction_prompt(&transcript)
    } else {
        recompaction_prompt(&previous_summary_text, &transcript)
    };

    let summary_request = CompletionRequest {
        model: request.model.clone(),
        input: vec![ChatMessage::user_text(summary_prompt)],
        ..Default::default()
    };

    let response = completer
        .complete(summary_request, CompletionOptions::default())
        .await?;
    let summary_text = response.text();
    if summary_text.is_empty() {
        return Err(AgentError::EmptySummary);
    }

    let mut meta = Map::new();
    meta.insert(COMPACTION_SUMMARY_META_KEY.to_string(), Value::Bool(true));
    let summary_message = ChatMessage {
        id: format!("compaction-summary-{}", Uuid::new_v4()),
        role: "user".to_string(),
        created: Some(chrono::Utc::now()),
        items: vec![CompletionItem {
            id: Uuid::new_v4().to_string(),
            content: Some(Content::Text {
                text: carry_forward_message(&summary_text),
                meta: Some(meta),
            }),
            ..Default::default()
        }],
    };

    let mut compacted_input = vec![summary_message];
    compacted_input.extend(new_input);

    let mut archived_messages = Vec::with_capacity(previous_compacted.len() + history.len());
    archived_messages.extend_from_slice(previous_compacted);
    archived_messages.extend(history);

    Ok(CompactResult {
        compacted_input,
        archived_messages,
    })
}

/// Render messages as a plain transcript for the summarizer. Long tool
/// results are cut at 5000 bytes; image data is elided.
pub fn build_transcript(messages: &[ChatMessage]) -> String {
    let mut out = String::new();

    for msg in messages {
        let role = if msg.role.is_empty() { "unknown" } else { &msg.role };

        for item in &msg.items {
            if let Some(content) = &item.content {
                if let Some(text) = content.as_text() {
                    if !text.is_empty() {
                        out.push_str(&format!("[{role}]: {text}\n"));
                    }
                }
            }
            if let Some(call) = &item.tool_call {
                out.push_str(&format!(
                    "[{role}] (tool call: {}): {}\n",
                    call.name, call.arguments
                ));
            }
            if let Some(result) = &item.tool_call_result {
                for content in &result.output.content {
                    match content {
                        Content::Text { text, .. } if !text.is_empty() => {
                            let shown = if text.len() > 5000 {
                                let cut = floor_boundary(text, 5000);
                                format!("{}... [truncated]", &text[..cut])
                            } else {
                                text.clone()
                            };
                            out.push_str(&format!("[tool result]: {shown}\n"));
                        }
                        Content::Image { .. } => {
                            out.push_str("[tool result]: [image data omitted]\n");
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    out
}

fn floor_boundary(text: &str, max: usize) -> usize {
    let mut cut = max.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

const SUMMARY_TEMPLATE: &str = "\
When constructing the summary, use this template:
## Goal

[What the user is trying to accomplish]

## Key Instructions & Preferences

- [Important constraints, preferences, or requirements]

## What Happened

[Key actions, decisions, and notable outcomes so far]

## Current State

[What is complete, what is in progress, and any known blockers]

## Next Steps

- [The next concrete actions the assistant should take]

## Open Questions / Risks

- [Any unresolved questions, ambiguities, or risks]
";

fn initial_compaction_prompt(transcript: &str) -> String {
    format!(
        "You are a helpful AI assistant tasked with summarizing conversations for handoff.

Provide a detailed but concise summary that will help another general-purpose assistant continue the conversation correctly.
Focus on:
- What has already been done
- What is currently in progress
- What should happen next
- Key user goals, constraints, preferences, and instructions that must persist
- Important decisions, facts, and context needed to avoid repeating work

{SUMMARY_TEMPLATE}
Do not answer questions from the transcript. Output only the summary.

--- CONVERSATION TRANSCRIPT ---
{transcript}
--- END TRANSCRIPT ---
"
    )
}

fn recompaction_prompt(previous_summary: &str, transcript: &str) -> String {
    format!(
        "You are a helpful AI assistant tasked with updating a conversation handoff summary.

You are given a previous summary plus new messages that occurred after that summary.
Create a single updated summary suitable for a general-purpose assistant to continue the conversation.

Merge rules:
- Treat the previous summary as prior context
- Integrate only the new information and status changes from the new messages
- Preserve unresolved tasks and open questions
- Remove or collapse duplicate details
- Keep completed items clearly marked as completed

{SUMMARY_TEMPLATE}
Do not answer questions from the transcript. Output only the updated summary.

--- PREVIOUS SUMMARY ---
{previous_summary}
--- END PREVIOUS SUMMARY ---

--- NEW MESSAGES ---
{transcript}
--- END NEW MESSAGES ---
"
    )
}

fn carry_forward_message(summary: &str) -> String {
    format!(
        "The conversation history was compacted to stay within context limits. \
         Continue the conversation naturally using the summary below as working context. \
         Do not mention this compaction unless the user asks.\n\n[Conversation Summary]\n{summary}"
    )
}
