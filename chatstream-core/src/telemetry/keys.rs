/// Span/Log attribute keys for chat turns.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_TURN_ID: &str = "turn.id";
pub const KEY_AGENT_ID: &str = "agent.id";
pub const KEY_WORKSPACE_ID: &str = "workspace.id";
pub const KEY_CONVERSATION_ID: &str = "conversation.id";
pub const KEY_SESSION_ID: &str = "session.id";
pub const KEY_UPSTREAM_REQUEST_ID: &str = "upstream.req_id";

pub const KEY_LATENCY_MS: &str = "latency.ms";
pub const KEY_OUTCOME: &str = "turn.outcome";
pub const KEY_TOKENS_INPUT: &str = "tokens.input";
pub const KEY_TOKENS_OUTPUT: &str = "tokens.output";
pub const KEY_COST_USD: &str = "cost.usd";
pub const KEY_TOOL_CALLS: &str = "tools.calls";
pub const KEY_TOOL_ERRORS: &str = "tools.errors";

/// Error-related (if applicable)
pub const KEY_ERROR_KIND: &str = "error.kind";
pub const KEY_ERROR_MESSAGE: &str = "error.message";
