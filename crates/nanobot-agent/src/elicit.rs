//! Elicitation and tool-call confirmation.
//!
//! Mid-turn, the core gathers synchronous input from the client by issuing
//! an `elicitation/create` request over the session and blocking on the
//! correlated reply. Tool-call confirmations ride the same mechanism with a
//! confirm marker in `_meta`; the auto-approve session flag short-circuits
//! them without a round-trip.

use serde_json::{Map, Value, json};
use uuid::Uuid;

use nanobot_session::{ExchangeOptions, Session};
use nanobot_types::{
    CallResult, Config, Content, ELICITATION_CREATE_METHOD, ElicitParams, ElicitResult,
    RequestId, TOOL_CONFIRM_TYPE, ToolCall,
};

use crate::error::Result;

/// Session flag enabling automatic approval of tool-call confirmations.
pub const AUTO_APPROVE_SESSION_KEY: &str = "autoApproveTools";

/// When the elicitation carries the tool-confirm marker and auto-approve is
/// on, synthesize the accepting answer locally.
pub fn auto_answer(params: &ElicitParams, auto_approve: bool) -> Option<ElicitResult> {
    if !auto_approve {
        return None;
    }
    let is_confirm = params
        .meta
        .as_ref()
        .and_then(|m| m.get("type"))
        .and_then(Value::as_str)
        == Some(TOOL_CONFIRM_TYPE);
    if !is_confirm {
        return None;
    }

    let mut content = Map::new();
    content.insert("answer".to_string(), json!("always"));
    Some(ElicitResult::accept(content))
}

/// Tool-call confirmations issued over a session.
#[derive(Clone, Default)]
pub struct Confirmations;

impl Confirmations {
    /// Ask the client to confirm a tool call. Returns `None` when the call
    /// may proceed, or a rejection [`CallResult`] to substitute for the
    /// dispatch.
    ///
    /// Calls targeting another agent or a flow never require confirmation.
    pub async fn confirm(
        &self,
        session: &Session,
        config: &Config,
        target_server: &str,
        call: &ToolCall,
    ) -> Result<Option<CallResult>> {
        if config.agents.contains_key(target_server) || config.flows.contains_key(target_server) {
            return Ok(None);
        }

        let params = confirm_params(target_server, call);
        let auto_approve = session.get::<bool>(AUTO_APPROVE_SESSION_KEY).unwrap_or(false);

        let result = match auto_answer(&params, auto_approve) {
            Some(result) => result,
            None => self.elicit(session, &params).await?,
        };

        if result.is_accept() {
            let answer = result
                .content
                .as_ref()
                .and_then(|c| c.get("answer"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if answer == "always" {
                session.set(AUTO_APPROVE_SESSION_KEY, &true);
            }
            return Ok(None);
        }

        tracing::info!(
            session_id = %session.id(),
            tool = %call.name,
            server = %target_server,
            action = %result.action,
            "tool call not approved"
        );
        Ok(Some(CallResult {
            content: vec![Content::text(format!(
                "The user declined the call to {} ({})",
                call.name, result.action
            ))],
            is_error: true,
            ..Default::default()
        }))
    }

    /// Send one elicitation and block for the correlated reply. Multiple
    /// elicitations may be outstanding on a session; correlation is strictly
    /// by request ID.
    pub async fn elicit(&self, session: &Session, params: &ElicitParams) -> Result<ElicitResult> {
        let request_id = RequestId::String(format!("elicit-{}", Uuid::new_v4()));
        let value = session
            .exchange(
                ELICITATION_CREATE_METHOD,
                serde_json::to_value(params)?,
                ExchangeOptions {
                    request_id: Some(request_id),
                    ..Default::default()
                },
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn confirm_params(target_server: &str, call: &ToolCall) -> ElicitParams {
    let mut meta = Map::new();
    meta.insert("type".to_string(), json!(TOOL_CONFIRM_TYPE));
    meta.insert("tool".to_string(), json!(call.name));
    meta.insert("mcpServer".to_string(), json!(target_server));
    meta.insert("arguments".to_string(), json!(call.arguments));
    meta.insert("callId".to_string(), json!(call.call_id));

    ElicitParams {
        message: format!("Allow the call to {} on {}?", call.name, target_server),
        requested_schema: json!({
            "type": "object",
            "properties": {
                "answer": {
                    "type": "string",
                    "enum": ["once", "always", "reject"],
                    "description": "Allow this call once, always, or reject it"
                }
            },
            "required": ["answer"]
        }),
        meta: Some(meta),
    }
}
