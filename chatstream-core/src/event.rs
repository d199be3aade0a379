//! The event catalog spoken on the chat stream.
//!
//! Contract:
//! - Events of one turn arrive in issuance order; a `tool_start` and its
//!   `tool_result` may be separated by unrelated `text` events.
//! - `error` and `done` are terminal for a turn.
//!
//! The event name travels on the SSE `event:` line and the payload is JSON in
//! the `data:` line, so decoding dispatches on the name rather than on a tag
//! inside the payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Usage;
use crate::sse::SseRecord;

pub const EV_SESSION: &str = "session";
pub const EV_TEXT: &str = "text";
pub const EV_REASONING: &str = "reasoning";
pub const EV_TOOL_START: &str = "tool_start";
pub const EV_TOOL_RESULT: &str = "tool_result";
pub const EV_ERROR: &str = "error";
pub const EV_DONE: &str = "done";

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Session {
        session_id: String,
        conversation_id: Option<String>,
    },
    Text(String),
    Reasoning(String),
    ToolStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        tool_call_id: String,
        result: Option<Value>,
        success: bool,
        duration_ms: Option<u64>,
    },
    Error {
        message: String,
    },
    Done {
        usage: Option<Usage>,
    },
}

// ---- Wire payloads ----
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct DeltaPayload {
    #[serde(alias = "content", alias = "delta")]
    text: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolStartPayload {
    #[serde(alias = "id")]
    tool_call_id: String,
    tool_name: String,
    #[serde(default)]
    args: Value,
}

fn default_success() -> bool {
    true
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolResultPayload {
    #[serde(alias = "id")]
    tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct ErrorPayload {
    #[serde(alias = "error")]
    message: String,
}

#[derive(Serialize, Deserialize)]
struct DonePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
}

impl StreamEvent {
    /// Decode one SSE record. Unknown event names and payloads that do not
    /// match the expected shape yield `None`.
    pub fn decode(rec: &SseRecord) -> Option<Self> {
        let data = rec.data.as_str();
        let ev = match rec.event.as_str() {
            EV_SESSION => {
                let p: SessionPayload = serde_json::from_str(data).ok()?;
                Self::Session {
                    session_id: p.session_id,
                    conversation_id: p.conversation_id,
                }
            }
            EV_TEXT => Self::Text(serde_json::from_str::<DeltaPayload>(data).ok()?.text),
            EV_REASONING => {
                Self::Reasoning(serde_json::from_str::<DeltaPayload>(data).ok()?.text)
            }
            EV_TOOL_START => {
                let p: ToolStartPayload = serde_json::from_str(data).ok()?;
                Self::ToolStart {
                    tool_call_id: p.tool_call_id,
                    tool_name: p.tool_name,
                    args: p.args,
                }
            }
            EV_TOOL_RESULT => {
                let p: ToolResultPayload = serde_json::from_str(data).ok()?;
                Self::ToolResult {
                    tool_call_id: p.tool_call_id,
                    result: p.result,
                    success: p.success,
                    duration_ms: p.duration_ms,
                }
            }
            EV_ERROR => Self::Error {
                message: serde_json::from_str::<ErrorPayload>(data).ok()?.message,
            },
            EV_DONE => Self::Done {
                usage: serde_json::from_str::<DonePayload>(data).ok()?.usage,
            },
            _ => return None,
        };
        Some(ev)
    }

    /// Encode into the record a server would emit.
    pub fn to_record(&self) -> SseRecord {
        let data = match self {
            Self::Session {
                session_id,
                conversation_id,
            } => serde_json::to_string(&SessionPayload {
                session_id: session_id.clone(),
                conversation_id: conversation_id.clone(),
            }),
            Self::Text(text) | Self::Reasoning(text) => {
                serde_json::to_string(&DeltaPayload { text: text.clone() })
            }
            Self::ToolStart {
                tool_call_id,
                tool_name,
                args,
            } => serde_json::to_string(&ToolStartPayload {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                args: args.clone(),
            }),
            Self::ToolResult {
                tool_call_id,
                result,
                success,
                duration_ms,
            } => serde_json::to_string(&ToolResultPayload {
                tool_call_id: tool_call_id.clone(),
                result: result.clone(),
                success: *success,
                duration_ms: *duration_ms,
            }),
            Self::Error { message } => serde_json::to_string(&ErrorPayload {
                message: message.clone(),
            }),
            Self::Done { usage } => serde_json::to_string(&DonePayload { usage: *usage }),
        };
        // Serializing plain structs of strings and JSON values cannot fail.
        SseRecord::new(self.name(), data.unwrap_or_else(|_| "{}".to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Session { .. } => EV_SESSION,
            Self::Text(_) => EV_TEXT,
            Self::Reasoning(_) => EV_REASONING,
            Self::ToolStart { .. } => EV_TOOL_START,
            Self::ToolResult { .. } => EV_TOOL_RESULT,
            Self::Error { .. } => EV_ERROR,
            Self::Done { .. } => EV_DONE,
        }
    }

    /// Returns true if this event ends the turn (`error` or `done`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }

    /// Convenience accessor for `text` contents.
    pub fn as_text_delta(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}
