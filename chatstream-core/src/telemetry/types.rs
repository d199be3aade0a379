use serde::{Deserialize, Serialize};

use super::keys::*;
use crate::model::Usage;

/// Structured record of one finished chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TurnLog {
    /// Client-generated id of the turn (also sent as `X-Request-Id`).
    pub turn_id: String,
    pub agent_id: Option<String>,
    pub workspace_id: Option<String>,
    pub conversation_id: Option<String>,
    /// Server-issued session id from the `session` event.
    pub session_id: Option<String>,
    /// Request id the server returned in its response headers.
    pub upstream_request_id: Option<String>,

    /// "completed", "failed", "interrupted", "cancelled" or "transport_error".
    pub outcome: String,
    pub latency_ms: Option<u64>,
    pub events: usize,

    pub tokens_input: Option<u64>,
    pub tokens_output: Option<u64>,
    pub cost_usd: Option<f64>,

    pub tool_calls: usize,
    pub tool_errors: usize,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl TurnLog {
    pub fn new(turn_id: impl Into<String>) -> Self {
        Self {
            turn_id: turn_id.into(),
            ..Default::default()
        }
    }

    pub fn agent(mut self, agent_id: &str, workspace_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self.workspace_id = Some(workspace_id.to_string());
        self
    }
    pub fn conversation_id_opt(mut self, v: Option<&str>) -> Self {
        self.conversation_id = v.map(|s| s.to_string());
        self
    }
    pub fn session_id_opt(mut self, v: Option<&str>) -> Self {
        self.session_id = v.map(|s| s.to_string());
        self
    }
    pub fn upstream_request_id_opt(mut self, v: Option<&str>) -> Self {
        self.upstream_request_id = v.map(|s| s.to_string());
        self
    }
    pub fn outcome(mut self, v: &str) -> Self {
        self.outcome = v.to_string();
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }
    pub fn events(mut self, n: usize) -> Self {
        self.events = n;
        self
    }
    pub fn usage_opt(mut self, usage: Option<&Usage>) -> Self {
        self.tokens_input = usage.map(|u| u.input_tokens);
        self.tokens_output = usage.map(|u| u.output_tokens);
        self.cost_usd = usage.map(|u| u.cost_usd);
        self
    }
    pub fn tools(mut self, calls: usize, errors: usize) -> Self {
        self.tool_calls = calls;
        self.tool_errors = errors;
        self
    }
    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }

    /// Flat `key=value` pairs using the stable attribute keys.
    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            (KEY_TURN_ID, self.turn_id.clone()),
            (KEY_OUTCOME, self.outcome.clone()),
        ];
        let opt = [
            (KEY_AGENT_ID, self.agent_id.clone()),
            (KEY_WORKSPACE_ID, self.workspace_id.clone()),
            (KEY_CONVERSATION_ID, self.conversation_id.clone()),
            (KEY_SESSION_ID, self.session_id.clone()),
            (KEY_UPSTREAM_REQUEST_ID, self.upstream_request_id.clone()),
            (KEY_LATENCY_MS, self.latency_ms.map(|v| v.to_string())),
            (KEY_TOKENS_INPUT, self.tokens_input.map(|v| v.to_string())),
            (KEY_TOKENS_OUTPUT, self.tokens_output.map(|v| v.to_string())),
            (KEY_COST_USD, self.cost_usd.map(|v| v.to_string())),
            (KEY_ERROR_KIND, self.error_kind.clone()),
            (KEY_ERROR_MESSAGE, self.error_message.clone()),
        ];
        out.extend(opt.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))));
        if self.tool_calls > 0 {
            out.push((KEY_TOOL_CALLS, self.tool_calls.to_string()));
            out.push((KEY_TOOL_ERRORS, self.tool_errors.to_string()));
        }
        out
    }
}
