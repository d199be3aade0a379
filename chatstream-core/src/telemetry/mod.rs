//! Telemetry primitives for chat turns.
//! Nothing is emitted unless a sink is attached to the session.

pub mod keys;
pub mod types;

pub use keys::*;
pub use types::*;

/// Implement this to receive telemetry events.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `record_turn` is called once per finished turn, from the task that ran it.
/// - Keep overhead minimal; implementations should avoid panicking.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_turn(&self, log: TurnLog);
}

/// Writes each turn as one `tracing` event at info level, with every
/// attribute from [`keys`] as its own field. Missing values are omitted.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record_turn(&self, log: TurnLog) {
        tracing::event!(
            target: "chatstream::turn",
            tracing::Level::INFO,
            turn.id = %log.turn_id,
            turn.outcome = %log.outcome,
            agent.id = log.agent_id.as_deref(),
            workspace.id = log.workspace_id.as_deref(),
            conversation.id = log.conversation_id.as_deref(),
            session.id = log.session_id.as_deref(),
            upstream.req_id = log.upstream_request_id.as_deref(),
            latency.ms = log.latency_ms,
            tokens.input = log.tokens_input,
            tokens.output = log.tokens_output,
            cost.usd = log.cost_usd,
            tools.calls = log.tool_calls as u64,
            tools.errors = log.tool_errors as u64,
            error.kind = log.error_kind.as_deref(),
            error.message = log.error_message.as_deref(),
            "turn finished"
        );
    }
}
