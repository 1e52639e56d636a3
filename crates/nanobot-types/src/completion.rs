//! The completion data model shared by the agent loop and the Completer.
//!
//! A [`CompletionRequest`] carries the full conversation as a list of
//! [`ChatMessage`]s, each made of [`CompletionItem`]s: plain content, tool
//! calls, tool call results, or reasoning summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::protocol::Content;

// ─────────────────────────────────────────────────────────────────────────────
// Well-known names
// ─────────────────────────────────────────────────────────────────────────────

/// Prefix of the synthetic tool that invokes an agent.
pub const AGENT_TOOL_PREFIX: &str = "chat-with-";
/// Description of the synthetic agent tool.
pub const AGENT_TOOL_DESCRIPTION: &str = "Chat with the agent";
/// Content-meta key that exempts a tool result from truncation.
pub const SKIP_TRUNCATION_META_KEY: &str = "ai.nanobot.meta/skip-truncation";
/// Content-meta key marking a compaction summary message.
pub const COMPACTION_SUMMARY_META_KEY: &str = "ai.nanobot.meta/compaction-summary";
/// Progress-meta key carrying a [`CompletionProgress`] payload.
pub const COMPLETION_PROGRESS_META_KEY: &str = "ai.nanobot.progress/completion";
/// Elicitation-meta type marker for tool-call confirmations.
pub const TOOL_CONFIRM_TYPE: &str = "ai.nanobot.confirm/tool-call";

/// Input schema of the synthetic `chat-with-<agent>` tool.
pub fn chat_input_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "required": ["prompt"],
        "properties": {
            "prompt": {
                "description": "The input prompt",
                "type": "string"
            },
            "attachments": {
                "type": "array",
                "items": {
                    "description": "An attachment to the prompt (optional)",
                    "type": "object",
                    "required": ["url"],
                    "properties": {
                        "name": {
                            "description": "The name of the resource, often the filename",
                            "type": "string"
                        },
                        "url": {
                            "description": "The URL of the attachment or data URI",
                            "type": "string"
                        },
                        "mimeType": {
                            "description": "The mime type of the content referenced by the URL",
                            "type": "string"
                        }
                    }
                }
            }
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages and items
// ─────────────────────────────────────────────────────────────────────────────

/// One conversation message: a role plus an ordered list of items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatMessage {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<CompletionItem>,
}

impl ChatMessage {
    /// A user message with a single text item.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::text("user", text)
    }

    /// An assistant message with a single text item.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::text("assistant", text)
    }

    fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: role.to_string(),
            created: Some(Utc::now()),
            items: vec![CompletionItem {
                id: Uuid::new_v4().to_string(),
                content: Some(Content::text(text)),
                ..Default::default()
            }],
        }
    }

    /// All text payloads in this message, joined with newlines.
    pub fn text_content(&self) -> String {
        let texts: Vec<&str> = self
            .items
            .iter()
            .filter_map(|item| item.content.as_ref())
            .filter_map(Content::as_text)
            .collect();
        texts.join("\n")
    }

    /// Iterate the tool calls in this message.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.items.iter().filter_map(|item| item.tool_call.as_ref())
    }

    /// True when any item carries the compaction-summary meta marker.
    pub fn is_compaction_summary(&self) -> bool {
        self.items.iter().any(|item| {
            item.content
                .as_ref()
                .map(|c| c.meta().is_some_and(|m| m.contains_key(COMPACTION_SUMMARY_META_KEY)))
                .unwrap_or(false)
        })
    }
}

/// One item of a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionItem {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_result: Option<ToolCallResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
}

impl CompletionItem {
    /// An item wrapping plain content.
    pub fn from_content(content: Content) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: Some(content),
            ..Default::default()
        }
    }
}

/// A tool call planned by the completer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolCall {
    /// Arguments as a raw JSON string, parsed at dispatch time.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub arguments: String,
    #[serde(rename = "call_id", skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
}

/// A tool call result fed back to the completer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolCallResult {
    #[serde(rename = "call_id", skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    pub output: CallResult,
}

/// The outcome of one tool dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallResult {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Content>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub agent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stop_reason: String,
}

/// Reasoning output from a completer, kept opaque.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Reasoning {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub summary: Vec<SummaryText>,
}

/// One reasoning summary fragment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryText {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests and responses
// ─────────────────────────────────────────────────────────────────────────────

/// A tool definition handed to the completer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolUseDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// A declared output schema for structured completion output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputSchema {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub strict: bool,
}

/// A full completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub system_prompt: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolUseDefinition>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool_choice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<OutputSchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub truncation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// The completer's reply: one assistant message plus the model that served it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionResponse {
    pub output: ChatMessage,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
}

impl CompletionResponse {
    /// The tool calls in the output, in completer order.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.output.tool_calls().collect()
    }

    /// All text in the output.
    pub fn text(&self) -> String {
        self.output.text_content()
    }
}

/// A streamed partial output routed through a progress token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionProgress {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub has_more: bool,
    pub item: CompletionItem,
}
