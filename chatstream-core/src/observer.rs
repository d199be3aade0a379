//! Callbacks for collaborators that react to a chat session.

use crate::model::{ToolCallState, Usage};

/// Observer for chat session events.
///
/// All methods default to no-ops so implementations pick what they need.
/// Callbacks run on the task driving the turn, outside any session lock;
/// implementations must be quick and must not call back into the session.
pub trait ChatObserver: Send + Sync {
    /// A conversation id was learned from the server for the first time.
    /// Invoked at most once per session, typically so the caller can persist it.
    fn on_conversation_started(&self, conversation_id: &str) {
        let _ = conversation_id;
    }

    /// A tool call entered the running state.
    fn on_tool_start(&self, call: &ToolCallState) {
        let _ = call;
    }

    /// A tool call finished (completed or error).
    fn on_tool_result(&self, call: &ToolCallState) {
        let _ = call;
    }

    /// A turn reached `done`.
    fn on_turn_finished(&self, usage: Option<&Usage>) {
        let _ = usage;
    }
}

/// Simple logging observer that logs session events using tracing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl ChatObserver for LoggingObserver {
    fn on_conversation_started(&self, conversation_id: &str) {
        tracing::info!(conversation_id = %conversation_id, "conversation started");
    }

    fn on_tool_start(&self, call: &ToolCallState) {
        tracing::debug!(
            tool_id = %call.id,
            tool_name = %call.tool_name,
            args = %call.args,
            "tool_start"
        );
    }

    fn on_tool_result(&self, call: &ToolCallState) {
        tracing::debug!(
            tool_id = %call.id,
            tool_name = %call.tool_name,
            status = ?call.status,
            duration_ms = ?call.duration_ms,
            "tool_result"
        );
    }

    fn on_turn_finished(&self, usage: Option<&Usage>) {
        if let Some(u) = usage {
            tracing::debug!(
                input_tokens = u.input_tokens,
                output_tokens = u.output_tokens,
                cost_usd = u.cost_usd,
                "turn finished"
            );
        }
    }
}
