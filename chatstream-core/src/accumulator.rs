//! Folds the events of one turn into the open assistant message.
//!
//! The accumulator is a plain synchronous reducer; publication of snapshots,
//! cancellation and the one-turn-at-a-time guard live in [`crate::session`].

use std::sync::Arc;

use crate::event::StreamEvent;
use crate::model::{ChatMessage, MessagePart, ToolCallState, ToolStatus, Usage};

/// What applying one event did to the turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// The message changed and should be republished.
    Updated,
    /// Server announced its session. `conversation_id` is whatever the server
    /// sent; adopting it is the caller's decision.
    Session {
        session_id: String,
        conversation_id: Option<String>,
    },
    /// A tool call began (or was restarted under the same id).
    ToolStarted { id: String },
    /// A known tool call finished.
    ToolFinished { id: String, status: ToolStatus },
    /// The server reported a failure; partial content is kept.
    Failed(String),
    /// The turn completed.
    Finished(Option<Usage>),
    /// Nothing changed (orphaned tool result, event after the turn ended).
    Ignored,
}

impl Applied {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Finished(_))
    }
}

#[derive(Debug)]
pub struct TurnAccumulator {
    message: ChatMessage,
    session_id: Option<String>,
    finished: bool,
    events: usize,
}

impl Default for TurnAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self {
            message: ChatMessage::assistant(),
            session_id: None,
            finished: false,
            events: 0,
        }
    }

    pub fn message(&self) -> &ChatMessage {
        &self.message
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of events applied so far, ignored ones included.
    pub fn events_seen(&self) -> usize {
        self.events
    }

    /// Immutable copy for publication.
    pub fn snapshot(&self) -> Arc<ChatMessage> {
        Arc::new(self.message.clone())
    }

    pub fn into_message(self) -> ChatMessage {
        self.message
    }

    pub fn apply(&mut self, event: StreamEvent) -> Applied {
        self.events += 1;
        if self.finished {
            return Applied::Ignored;
        }

        match event {
            StreamEvent::Session {
                session_id,
                conversation_id,
            } => {
                self.session_id = Some(session_id.clone());
                Applied::Session {
                    session_id,
                    conversation_id,
                }
            }
            StreamEvent::Text(delta) => {
                self.message.content.push_str(&delta);
                append_part(&mut self.message.parts, delta, false);
                Applied::Updated
            }
            StreamEvent::Reasoning(delta) => {
                self.message.reasoning.push_str(&delta);
                append_part(&mut self.message.parts, delta, true);
                Applied::Updated
            }
            StreamEvent::ToolStart {
                tool_call_id,
                tool_name,
                args,
            } => {
                let mut call = ToolCallState::pending(tool_call_id.clone(), tool_name, args);
                call.status = ToolStatus::Running;
                match self.message.tool_call_mut(&tool_call_id) {
                    Some(existing) => *existing = call,
                    None => {
                        self.message.tool_calls.push(call);
                        self.message.parts.push(MessagePart::ToolCall {
                            id: tool_call_id.clone(),
                        });
                    }
                }
                Applied::ToolStarted { id: tool_call_id }
            }
            StreamEvent::ToolResult {
                tool_call_id,
                result,
                success,
                duration_ms,
            } => {
                let Some(call) = self.message.tool_call_mut(&tool_call_id) else {
                    tracing::debug!(
                        tool_call_id = %tool_call_id,
                        "tool result without matching start"
                    );
                    return Applied::Ignored;
                };
                call.result = result;
                call.duration_ms = duration_ms;
                call.status = if success {
                    ToolStatus::Completed
                } else {
                    ToolStatus::Error
                };
                Applied::ToolFinished {
                    id: tool_call_id,
                    status: call.status,
                }
            }
            StreamEvent::Error { message } => {
                self.finished = true;
                Applied::Failed(message)
            }
            StreamEvent::Done { usage } => {
                self.finished = true;
                self.message.usage = usage;
                Applied::Finished(usage)
            }
        }
    }
}

// Consecutive deltas of the same kind extend the last part.
fn append_part(parts: &mut Vec<MessagePart>, delta: String, reasoning: bool) {
    let extended = match parts.last_mut() {
        Some(MessagePart::Text { text }) if !reasoning => {
            text.push_str(&delta);
            true
        }
        Some(MessagePart::Reasoning { text }) if reasoning => {
            text.push_str(&delta);
            true
        }
        _ => false,
    };
    if !extended {
        parts.push(if reasoning {
            MessagePart::Reasoning { text: delta }
        } else {
            MessagePart::Text { text: delta }
        });
    }
}
