use acp2_error::ErrorDetail;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Message role on the north surface and in the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

/// A north-side message. Content blocks are kept as raw JSON values so that
/// unknown block variants round-trip verbatim and in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Value>,
}

impl Message {
    pub fn agent(content: Vec<Value>) -> Self {
        Self {
            role: Role::Agent,
            content,
        }
    }
}

/// Build a `{type: "text", text}` content block.
pub fn text_block(text: impl Into<String>) -> Value {
    json!({"type": "text", "text": text.into()})
}

/// Extract the text of a `{type: "text"}` content block, if that is what
/// `block` is.
pub fn block_text(block: &Value) -> Option<&str> {
    if block.get("type").and_then(Value::as_str) == Some("text") {
        block.get("text").and_then(Value::as_str)
    } else {
        None
    }
}

/// An event on a run's stream, derived from south-side `session/update`
/// notifications plus the three terminal outcomes.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    AgentMessageChunk { text: String },
    ToolCall(Value),
    Plan(Value),
    Thought(Value),
    /// Forward-compatible pass-through for update kinds the bridge does not
    /// interpret.
    Other(Value),
    Cancelled,
    Completed {
        message: Message,
        stop_reason: Option<String>,
    },
    Failed(ErrorDetail),
}

impl UpdateEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Completed { .. } | Self::Failed(_)
        )
    }

    /// SSE event name for this variant. Every non-terminal event travels as
    /// `update`.
    pub fn sse_event(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Completed { .. } => "completed",
            Self::Failed(_) => "failed",
            _ => "update",
        }
    }

    /// SSE data payload. Terminal frames embed the run id and status so a
    /// client can correlate without a second request.
    pub fn sse_data(&self, run_id: &str) -> Value {
        match self {
            Self::AgentMessageChunk { text } => {
                json!({"type": "agent_message_chunk", "text": text})
            }
            Self::ToolCall(update) => json!({"type": "tool_call", "data": update}),
            Self::Plan(update) => json!({"type": "plan", "data": update}),
            Self::Thought(update) => json!({"type": "thought", "data": update}),
            Self::Other(update) => json!({"type": "update", "data": update}),
            Self::Cancelled => json!({"run_id": run_id, "status": "cancelled"}),
            Self::Completed {
                message,
                stop_reason,
            } => json!({
                "run_id": run_id,
                "status": "completed",
                "output": message,
                "stop_reason": stop_reason,
            }),
            Self::Failed(detail) => {
                json!({"run_id": run_id, "status": "failed", "error": detail})
            }
        }
    }
}

/// Parse the `update` object of a `session/update` notification into an
/// [`UpdateEvent`]. Unknown `sessionUpdate` kinds pass through opaquely.
pub fn parse_session_update(update: &Value) -> UpdateEvent {
    match update.get("sessionUpdate").and_then(Value::as_str) {
        Some("agent_message_chunk") => {
            let text = update
                .get("content")
                .and_then(|content| content.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            UpdateEvent::AgentMessageChunk { text }
        }
        Some("tool_call") | Some("tool_call_update") => UpdateEvent::ToolCall(update.clone()),
        Some("plan") => UpdateEvent::Plan(update.clone()),
        Some("agent_thought_chunk") => UpdateEvent::Thought(update.clone()),
        _ => UpdateEvent::Other(update.clone()),
    }
}
