use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Token and cost accounting reported by the server on `done`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Accumulate another turn's usage into a running total.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cost_usd += other.cost_usd;
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallState {
    pub id: String,
    pub tool_name: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ToolCallState {
    pub fn pending(id: impl Into<String>, tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            args,
            result: None,
            status: ToolStatus::Pending,
            duration_ms: None,
        }
    }
}

/// One entry in the ordered rendering timeline of a message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Reasoning { text: String },
    ToolCall { id: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    /// First-seen order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub created_at_ms: i64,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: new_message_id(),
            role: Role::User,
            parts: vec![MessagePart::Text {
                text: content.clone(),
            }],
            content,
            reasoning: String::new(),
            tool_calls: Vec::new(),
            usage: None,
            created_at_ms: now_ms(),
        }
    }

    pub fn assistant() -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            content: String::new(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            parts: Vec::new(),
            usage: None,
            created_at_ms: now_ms(),
        }
    }

    pub fn tool_call(&self, id: &str) -> Option<&ToolCallState> {
        self.tool_calls.iter().find(|t| t.id == id)
    }

    pub(crate) fn tool_call_mut(&mut self, id: &str) -> Option<&mut ToolCallState> {
        self.tool_calls.iter_mut().find(|t| t.id == id)
    }
}

/// Body of the chat POST.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub agent_id: String,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

pub(crate) fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_request_uses_camel_case_and_skips_missing_conversation() {
        let req = ChatRequest {
            message: "hi".into(),
            agent_id: "agent-1".into(),
            workspace_id: "ws-1".into(),
            conversation_id: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            json!({"message": "hi", "agentId": "agent-1", "workspaceId": "ws-1"})
        );

        let with_conv = ChatRequest {
            conversation_id: Some("c-9".into()),
            ..req
        };
        let v = serde_json::to_value(&with_conv).unwrap();
        assert_eq!(v["conversationId"], json!("c-9"));
    }

    #[test]
    fn usage_defaults_missing_fields_and_accumulates() {
        let u: Usage = serde_json::from_value(json!({"inputTokens": 5})).unwrap();
        assert_eq!(u.output_tokens, 0);
        assert_eq!(u.cost_usd, 0.0);

        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 5,
            output_tokens: 2,
            cost_usd: 0.001,
        });
        total.add(&Usage {
            input_tokens: 1,
            output_tokens: 1,
            cost_usd: 0.002,
        });
        assert_eq!(total.input_tokens, 6);
        assert_eq!(total.total_tokens(), 9);
        assert!((total.cost_usd - 0.003).abs() < 1e-12);
    }

    #[test]
    fn tool_status_serializes_snake_case() {
        let s = serde_json::to_string(&ToolStatus::Completed).unwrap();
        assert_eq!(s, "\"completed\"");
        assert!(ToolStatus::Error.is_finished());
        assert!(!ToolStatus::Running.is_finished());
    }

    #[test]
    fn user_message_has_single_text_part() {
        let m = ChatMessage::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.parts, vec![MessagePart::Text { text: "hello".into() }]);
        assert!(!m.id.is_empty());
    }
}
