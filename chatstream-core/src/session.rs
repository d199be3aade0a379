//! One chat session: drives turns over a [`ChatTransport`] and publishes
//! snapshots of the message list.
//!
//! Contract:
//! - At most one turn is in flight. `send_message` while a turn is active
//!   returns [`TurnOutcome::Ignored`]; nothing is queued.
//! - Every change publishes a [`ChatSnapshot`] with a strictly larger
//!   `version`. Messages that did not change are shared between snapshots.
//! - `cancel` restores the message list to exactly what it was before the
//!   cancelled `send_message`, with no error shown.
//! - An `error` event or a transport failure leaves partial content in place
//!   and sets [`ChatStatus::Error`].
//!
//! Only the task running `send_message` touches the open turn. A generation
//! number ties each turn to its state; once a turn is cancelled, whatever its
//! reader still holds is discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing_futures::Instrument;

use crate::accumulator::{Applied, TurnAccumulator};
use crate::error::{ChatStreamError, CoreResult};
use crate::model::{ChatMessage, ChatRequest, ToolStatus, Usage, new_message_id};
use crate::normalizer::{clean_id, normalize_message};
use crate::observer::ChatObserver;
use crate::telemetry::{TelemetrySink, TurnLog};
use crate::transport::ChatTransport;

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    #[default]
    Idle,
    Streaming,
    Error,
}

/// Immutable view of the session published after every change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    pub version: u64,
    pub messages: Arc<[Arc<ChatMessage>]>,
    pub status: ChatStatus,
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub last_usage: Option<Usage>,
    pub total_usage: Usage,
}

impl ChatSnapshot {
    pub fn is_streaming(&self) -> bool {
        self.status == ChatStatus::Streaming
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last().map(|m| m.as_ref())
    }
}

/// How a call to [`ChatSession::send_message`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Blank message, or another turn was already in flight.
    Ignored,
    Completed { usage: Option<Usage> },
    /// The server sent an `error` event.
    Failed { message: String },
    /// The stream ended before `done`.
    Interrupted,
    Cancelled,
}

impl TurnOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Interrupted => "interrupted",
            Self::Cancelled => "cancelled",
        }
    }
}

struct ActiveTurn {
    generation: u64,
    abort: AbortHandle,
    // message count before the user message was appended
    baseline: usize,
    assistant_index: Option<usize>,
}

#[derive(Default)]
struct State {
    messages: Vec<Arc<ChatMessage>>,
    status: ChatStatus,
    error: Option<String>,
    session_id: Option<String>,
    conversation_id: Option<String>,
    last_usage: Option<Usage>,
    total_usage: Usage,
    version: u64,
    generations: u64,
    active: Option<ActiveTurn>,
}

impl State {
    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }

    fn to_snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            version: self.version,
            messages: self.messages.iter().cloned().collect(),
            status: self.status,
            error: self.error.clone(),
            session_id: self.session_id.clone(),
            conversation_id: self.conversation_id.clone(),
            last_usage: self.last_usage,
            total_usage: self.total_usage,
        }
    }
}

struct Inner {
    transport: Arc<dyn ChatTransport>,
    agent_id: String,
    workspace_id: String,
    observer: Option<Arc<dyn ChatObserver>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    state: Mutex<State>,
    tx: watch::Sender<ChatSnapshot>,
}

/// Result of folding one event into shared state.
enum Commit {
    /// The turn was cancelled; stop reading.
    Stale,
    Applied { new_conversation: Option<String> },
}

#[derive(Default)]
struct TurnStats {
    session_id: Option<String>,
    conversation_id: Option<String>,
    upstream_request_id: Option<String>,
    events: usize,
    tool_calls: usize,
    tool_errors: usize,
    usage: Option<Usage>,
    error_kind: Option<&'static str>,
    error_message: Option<String>,
}

/// Rolls back the turn it was armed for if `send_message` is dropped before
/// the turn ends, as when a caller times it out or loses a `select!`.
struct TurnGuard<'a> {
    session: &'a ChatSession,
    generation: u64,
    armed: bool,
}

impl TurnGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.session.rollback(self.generation) {
            tracing::debug!(generation = self.generation, "send dropped mid-turn; rolled back");
        }
    }
}

/// Handle to a chat session. Clones share the same session.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

pub struct ChatSessionBuilder {
    transport: Arc<dyn ChatTransport>,
    agent_id: Option<String>,
    workspace_id: Option<String>,
    conversation_id: Option<String>,
    history: Vec<ChatMessage>,
    observer: Option<Arc<dyn ChatObserver>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl ChatSessionBuilder {
    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    /// Continue an existing conversation instead of letting the server start one.
    pub fn conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    /// Messages already shown for the conversation.
    pub fn history(mut self, messages: Vec<ChatMessage>) -> Self {
        self.history = messages;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ChatObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn build(self) -> CoreResult<ChatSession> {
        let agent_id = self
            .agent_id
            .as_deref()
            .and_then(clean_id)
            .ok_or_else(|| ChatStreamError::Validation("agent id is required".into()))?
            .to_string();
        let workspace_id = self
            .workspace_id
            .as_deref()
            .and_then(clean_id)
            .ok_or_else(|| ChatStreamError::Validation("workspace id is required".into()))?
            .to_string();
        let conversation_id = self
            .conversation_id
            .as_deref()
            .and_then(clean_id)
            .map(str::to_string);

        let state = State {
            messages: self.history.into_iter().map(Arc::new).collect(),
            conversation_id,
            ..Default::default()
        };
        let (tx, _rx) = watch::channel(state.to_snapshot());

        Ok(ChatSession {
            inner: Arc::new(Inner {
                transport: self.transport,
                agent_id,
                workspace_id,
                observer: self.observer,
                telemetry: self.telemetry,
                state: Mutex::new(state),
                tx,
            }),
        })
    }
}

impl ChatSession {
    pub fn builder(transport: Arc<dyn ChatTransport>) -> ChatSessionBuilder {
        ChatSessionBuilder {
            transport,
            agent_id: None,
            workspace_id: None,
            conversation_id: None,
            history: Vec::new(),
            observer: None,
            telemetry: None,
        }
    }

    /// Receive every snapshot published from now on.
    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.inner.tx.subscribe()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.inner.tx.borrow().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.lock().conversation_id.clone()
    }

    /// Send a user message and fold the response stream until the turn ends.
    pub async fn send_message(&self, text: &str) -> CoreResult<TurnOutcome> {
        let Some(text) = normalize_message(text) else {
            return Ok(TurnOutcome::Ignored);
        };

        let (abort, registration) = AbortHandle::new_pair();
        let turn_id = new_message_id();
        let (generation, request) = {
            let mut st = self.lock();
            if st.active.is_some() {
                tracing::debug!("turn already in flight; ignoring send");
                return Ok(TurnOutcome::Ignored);
            }
            st.generations += 1;
            let generation = st.generations;
            let baseline = st.messages.len();
            st.messages.push(Arc::new(ChatMessage::user(text.clone())));
            st.status = ChatStatus::Streaming;
            st.error = None;
            st.active = Some(ActiveTurn {
                generation,
                abort,
                baseline,
                assistant_index: None,
            });
            self.publish(&mut st);
            let request = ChatRequest {
                message: text,
                agent_id: self.inner.agent_id.clone(),
                workspace_id: self.inner.workspace_id.clone(),
                conversation_id: st.conversation_id.clone(),
            };
            (generation, request)
        };

        let span = tracing::info_span!(
            "chat.turn",
            turn.id = %turn_id,
            agent.id = %self.inner.agent_id,
            workspace.id = %self.inner.workspace_id,
            transport = %self.inner.transport.name(),
        );
        let started = Instant::now();
        let mut stats = TurnStats {
            conversation_id: request.conversation_id.clone(),
            ..Default::default()
        };
        let guard = TurnGuard {
            session: self,
            generation,
            armed: true,
        };
        let driven = Abortable::new(
            self.drive(generation, &request, &turn_id, &mut stats),
            registration,
        )
        .instrument(span.clone())
        .await;
        guard.disarm();

        let result = match driven {
            Ok(result) => result,
            Err(_aborted) => Ok(TurnOutcome::Cancelled),
        };

        span.in_scope(|| match &result {
            Ok(outcome) => tracing::info!(
                outcome = outcome.label(),
                events = stats.events,
                latency_ms = started.elapsed().as_millis() as u64,
                "turn ended"
            ),
            Err(e) => tracing::warn!(error = %e, kind = e.kind(), "turn failed"),
        });
        self.record_turn(&turn_id, &result, &stats, started);
        result
    }

    /// Abort the in-flight turn and drop everything it added to the message
    /// list. Returns false when no turn was in flight.
    pub fn cancel(&self) -> bool {
        let mut st = self.lock();
        let Some(active) = st.active.take() else {
            return false;
        };
        tracing::debug!(generation = active.generation, "turn cancelled");
        self.restore(&mut st, active);
        true
    }

    /// Undo the turn `generation` if it is still the one in flight.
    fn rollback(&self, generation: u64) -> bool {
        let mut st = self.lock();
        if !st.is_current(generation) {
            return false;
        }
        match st.active.take() {
            Some(active) => {
                self.restore(&mut st, active);
                true
            }
            None => false,
        }
    }

    fn restore(&self, st: &mut State, active: ActiveTurn) {
        active.abort.abort();
        st.messages.truncate(active.baseline);
        st.status = ChatStatus::Idle;
        st.error = None;
        self.publish(st);
    }

    async fn drive(
        &self,
        generation: u64,
        request: &ChatRequest,
        turn_id: &str,
        stats: &mut TurnStats,
    ) -> CoreResult<TurnOutcome> {
        let opened = match self.inner.transport.open(request, turn_id).await {
            Ok(opened) => opened,
            Err(e) => {
                self.fail(generation, &e, stats);
                return Err(e);
            }
        };
        stats.upstream_request_id = opened.upstream_request_id;
        let mut events = opened.events;
        let mut acc = TurnAccumulator::new();

        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    self.fail(generation, &e, stats);
                    return Err(e);
                }
            };
            let applied = acc.apply(event);
            stats.events = acc.events_seen();

            let new_conversation = match self.commit(generation, &acc, &applied, stats) {
                Commit::Stale => return Ok(TurnOutcome::Cancelled),
                Commit::Applied { new_conversation } => new_conversation,
            };
            self.notify(&acc, &applied, new_conversation.as_deref());

            match applied {
                Applied::Failed(message) => {
                    stats.error_kind = Some("server");
                    stats.error_message = Some(message.clone());
                    count_tools(&acc, stats);
                    return Ok(TurnOutcome::Failed { message });
                }
                Applied::Finished(usage) => {
                    stats.usage = usage;
                    count_tools(&acc, stats);
                    return Ok(TurnOutcome::Completed { usage });
                }
                _ => {}
            }
        }

        count_tools(&acc, stats);
        let mut st = self.lock();
        if !st.is_current(generation) {
            return Ok(TurnOutcome::Cancelled);
        }
        tracing::warn!(events = stats.events, "stream ended before done");
        st.active = None;
        st.status = ChatStatus::Idle;
        self.publish(&mut st);
        Ok(TurnOutcome::Interrupted)
    }

    fn commit(
        &self,
        generation: u64,
        acc: &TurnAccumulator,
        applied: &Applied,
        stats: &mut TurnStats,
    ) -> Commit {
        let mut guard = self.lock();
        let st = &mut *guard;
        let Some(active) = st.active.as_mut().filter(|a| a.generation == generation) else {
            return Commit::Stale;
        };

        // The assistant message joins the list on the first event of the turn.
        let changed = match active.assistant_index {
            None => {
                let idx = st.messages.len();
                active.assistant_index = Some(idx);
                st.messages.push(acc.snapshot());
                true
            }
            Some(_) if matches!(applied, Applied::Ignored) => false,
            Some(idx) => {
                st.messages[idx] = acc.snapshot();
                true
            }
        };

        let mut new_conversation = None;
        match applied {
            Applied::Session {
                session_id,
                conversation_id,
            } => {
                st.session_id = Some(session_id.clone());
                stats.session_id = Some(session_id.clone());
                if st.conversation_id.is_none()
                    && let Some(conv) = conversation_id.as_deref().and_then(clean_id)
                {
                    st.conversation_id = Some(conv.to_string());
                    new_conversation = Some(conv.to_string());
                }
                stats.conversation_id = st.conversation_id.clone();
            }
            Applied::Failed(message) => {
                st.active = None;
                st.status = ChatStatus::Error;
                st.error = Some(message.clone());
            }
            Applied::Finished(usage) => {
                st.active = None;
                st.status = ChatStatus::Idle;
                st.last_usage = *usage;
                if let Some(u) = usage {
                    st.total_usage.add(u);
                }
            }
            _ => {}
        }

        if changed || !matches!(applied, Applied::Ignored) {
            self.publish(st);
        }
        Commit::Applied { new_conversation }
    }

    fn fail(&self, generation: u64, err: &ChatStreamError, stats: &mut TurnStats) {
        stats.error_kind = Some(err.kind());
        stats.error_message = Some(err.to_string());
        let mut st = self.lock();
        if !st.is_current(generation) {
            return;
        }
        st.active = None;
        st.status = ChatStatus::Error;
        st.error = Some(err.to_string());
        self.publish(&mut st);
    }

    fn notify(&self, acc: &TurnAccumulator, applied: &Applied, new_conversation: Option<&str>) {
        let Some(obs) = self.inner.observer.as_deref() else {
            return;
        };
        if let Some(conv) = new_conversation {
            obs.on_conversation_started(conv);
        }
        match applied {
            Applied::ToolStarted { id } => {
                if let Some(call) = acc.message().tool_call(id) {
                    obs.on_tool_start(call);
                }
            }
            Applied::ToolFinished { id, .. } => {
                if let Some(call) = acc.message().tool_call(id) {
                    obs.on_tool_result(call);
                }
            }
            Applied::Finished(usage) => obs.on_turn_finished(usage.as_ref()),
            _ => {}
        }
    }

    fn record_turn(
        &self,
        turn_id: &str,
        result: &CoreResult<TurnOutcome>,
        stats: &TurnStats,
        started: Instant,
    ) {
        let Some(sink) = self.inner.telemetry.as_deref() else {
            return;
        };
        let outcome = match result {
            Ok(o) => o.label(),
            Err(_) => "transport_error",
        };
        let mut log = TurnLog::new(turn_id)
            .agent(&self.inner.agent_id, &self.inner.workspace_id)
            .conversation_id_opt(stats.conversation_id.as_deref())
            .session_id_opt(stats.session_id.as_deref())
            .upstream_request_id_opt(stats.upstream_request_id.as_deref())
            .outcome(outcome)
            .latency_ms(started.elapsed().as_millis() as u64)
            .events(stats.events)
            .usage_opt(stats.usage.as_ref())
            .tools(stats.tool_calls, stats.tool_errors);
        if let (Some(kind), Some(message)) = (stats.error_kind, stats.error_message.as_deref()) {
            log = log.error(kind, message);
        }
        sink.record_turn(log);
    }

    fn publish(&self, st: &mut State) {
        st.version += 1;
        self.inner.tx.send_replace(st.to_snapshot());
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn count_tools(acc: &TurnAccumulator, stats: &mut TurnStats) {
    let calls = &acc.message().tool_calls;
    stats.tool_calls = calls.len();
    stats.tool_errors = calls
        .iter()
        .filter(|c| c.status == ToolStatus::Error)
        .count();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StreamEvent;
    use crate::model::{Role, ToolStatus};
    use crate::transport::{OpenedStream, ReplayTransport};
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;

    fn session(transport: Arc<dyn ChatTransport>) -> ChatSession {
        ChatSession::builder(transport)
            .agent("agent-1")
            .workspace("ws-1")
            .build()
            .expect("session")
    }

    fn usage() -> Usage {
        Usage {
            input_tokens: 5,
            output_tokens: 2,
            cost_usd: 0.001,
        }
    }

    fn body(events: &[StreamEvent]) -> Bytes {
        events
            .iter()
            .map(|e| e.to_record().encode())
            .collect::<String>()
            .into()
    }

    /// Fails to open, or yields some events then a transport error.
    struct BrokenTransport {
        before_error: Vec<StreamEvent>,
        fail_open: bool,
    }

    #[async_trait]
    impl ChatTransport for BrokenTransport {
        fn name(&self) -> &str {
            "broken"
        }

        async fn open(&self, _req: &ChatRequest, _turn_id: &str) -> CoreResult<OpenedStream> {
            if self.fail_open {
                return Err(ChatStreamError::Unavailable {
                    endpoint: "http".into(),
                });
            }
            let mut items: Vec<CoreResult<StreamEvent>> =
                self.before_error.iter().cloned().map(Ok).collect();
            items.push(Err(ChatStreamError::Transport("connection reset".into())));
            Ok(OpenedStream {
                events: futures::stream::iter(items).boxed(),
                upstream_request_id: None,
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        conversations: Mutex<Vec<String>>,
        tools: Mutex<Vec<(String, ToolStatus)>>,
        finished: Mutex<usize>,
    }

    impl ChatObserver for Recorder {
        fn on_conversation_started(&self, conversation_id: &str) {
            self.conversations.lock().unwrap().push(conversation_id.to_string());
        }
        fn on_tool_start(&self, call: &crate::model::ToolCallState) {
            self.tools.lock().unwrap().push((call.id.clone(), call.status));
        }
        fn on_tool_result(&self, call: &crate::model::ToolCallState) {
            self.tools.lock().unwrap().push((call.id.clone(), call.status));
        }
        fn on_turn_finished(&self, _usage: Option<&Usage>) {
            *self.finished.lock().unwrap() += 1;
        }
    }

    #[derive(Default)]
    struct MemorySink {
        logs: Mutex<Vec<TurnLog>>,
    }

    impl TelemetrySink for MemorySink {
        fn record_turn(&self, log: TurnLog) {
            self.logs.lock().unwrap().push(log);
        }
    }

    #[tokio::test]
    async fn hello_world_turn_completes_with_usage() {
        let transport = ReplayTransport::from_events(&[
            StreamEvent::Session {
                session_id: "s1".into(),
                conversation_id: None,
            },
            StreamEvent::Text("Hello ".into()),
            StreamEvent::Text("world".into()),
            StreamEvent::Done {
                usage: Some(usage()),
            },
        ])
        .chunk_size(7);
        let chat = session(Arc::new(transport));

        let outcome = chat.send_message("hi there").await.unwrap();
        assert_eq!(outcome, TurnOutcome::Completed { usage: Some(usage()) });

        let snap = chat.snapshot();
        assert_eq!(snap.messages.len(), 2);
        assert_eq!(snap.messages[0].role, Role::User);
        assert_eq!(snap.messages[0].content, "hi there");
        let reply = snap.last_message().unwrap();
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, "Hello world");
        assert_eq!(reply.usage.map(|u| u.cost_usd), Some(0.001));
        assert_eq!(snap.status, ChatStatus::Idle);
        assert_eq!(snap.session_id.as_deref(), Some("s1"));
        assert_eq!(snap.last_usage, Some(usage()));
        assert_eq!(snap.total_usage.total_tokens(), 7);
        // user message + one publication per event
        assert_eq!(snap.version, 5);
        assert!(!chat.is_streaming());
    }

    #[tokio::test]
    async fn unchanged_messages_are_shared_between_snapshots() {
        let transport = ReplayTransport::from_events(&[
            StreamEvent::Text("a".into()),
            StreamEvent::Done { usage: None },
        ]);
        let chat = session(Arc::new(transport));
        chat.send_message("first").await.unwrap();
        let before = chat.snapshot();
        chat.send_message("second").await.unwrap();
        let after = chat.snapshot();

        assert!(after.version > before.version);
        assert_eq!(after.messages.len(), 4);
        assert!(Arc::ptr_eq(&before.messages[0], &after.messages[0]));
        assert!(Arc::ptr_eq(&before.messages[1], &after.messages[1]));
    }

    #[tokio::test]
    async fn subscribers_see_strictly_increasing_versions() {
        let transport = ReplayTransport::from_events(&[
            StreamEvent::Text("x".into()),
            StreamEvent::Text("y".into()),
            StreamEvent::Done { usage: None },
        ]);
        let chat = session(Arc::new(transport));
        let mut rx = chat.subscribe();
        let watcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let snap = rx.borrow_and_update().clone();
                seen.push(snap.version);
                if snap.status == ChatStatus::Idle && snap.messages.len() == 2 {
                    break;
                }
            }
            seen
        });

        chat.send_message("go").await.unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher finished")
            .unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "versions: {seen:?}");
    }

    #[tokio::test]
    async fn tool_call_completes_and_observer_is_told() {
        let transport = ReplayTransport::from_events(&[
            StreamEvent::ToolStart {
                tool_call_id: "t1".into(),
                tool_name: "search".into(),
                args: json!({"q": "invoices"}),
            },
            StreamEvent::Text("Found some.".into()),
            StreamEvent::ToolResult {
                tool_call_id: "t1".into(),
                result: Some(json!({"hits": 3})),
                success: true,
                duration_ms: Some(15),
            },
            StreamEvent::Done { usage: None },
        ]);
        let recorder = Arc::new(Recorder::default());
        let chat = ChatSession::builder(Arc::new(transport))
            .agent("agent-1")
            .workspace("ws-1")
            .observer(recorder.clone())
            .build()
            .unwrap();

        chat.send_message("search invoices").await.unwrap();
        let snap = chat.snapshot();
        let call = snap.last_message().unwrap().tool_call("t1").unwrap().clone();
        assert_eq!(call.status, ToolStatus::Completed);
        assert_eq!(call.result.unwrap()["hits"], json!(3));
        assert_eq!(
            *recorder.tools.lock().unwrap(),
            vec![
                ("t1".to_string(), ToolStatus::Running),
                ("t1".to_string(), ToolStatus::Completed)
            ]
        );
        assert_eq!(*recorder.finished.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn orphaned_tool_result_changes_nothing() {
        let transport = ReplayTransport::from_events(&[
            StreamEvent::Text("a".into()),
            StreamEvent::ToolResult {
                tool_call_id: "ghost".into(),
                result: None,
                success: true,
                duration_ms: None,
            },
            StreamEvent::Done { usage: None },
        ]);
        let chat = session(Arc::new(transport));
        chat.send_message("q").await.unwrap();
        let snap = chat.snapshot();
        let reply = snap.last_message().unwrap();
        assert_eq!(reply.content, "a");
        assert!(reply.tool_calls.is_empty());
        // the ignored event publishes nothing
        assert_eq!(snap.version, 3);
    }

    #[tokio::test]
    async fn error_event_keeps_partial_text_and_surfaces_message() {
        let transport = ReplayTransport::from_turns(vec![
            body(&[
                StreamEvent::Text("partial ".into()),
                StreamEvent::Error {
                    message: "agent crashed".into(),
                },
            ]),
            body(&[StreamEvent::Text("ok".into()), StreamEvent::Done { usage: None }]),
        ]);
        let chat = session(Arc::new(transport));

        let outcome = chat.send_message("do it").await.unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Failed {
                message: "agent crashed".into()
            }
        );
        let snap = chat.snapshot();
        assert_eq!(snap.status, ChatStatus::Error);
        assert_eq!(snap.error.as_deref(), Some("agent crashed"));
        assert_eq!(snap.last_message().unwrap().content, "partial ");
        assert!(!chat.is_streaming());

        // retrying is up to the caller and clears the error
        let outcome = chat.send_message("again").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        let snap = chat.snapshot();
        assert_eq!(snap.status, ChatStatus::Idle);
        assert_eq!(snap.error, None);
        assert_eq!(snap.messages.len(), 4);
    }

    #[tokio::test]
    async fn cancel_restores_message_list() {
        let transport = ReplayTransport::from_events(&[
            StreamEvent::ToolStart {
                tool_call_id: "t1".into(),
                tool_name: "search".into(),
                args: json!({}),
            },
            StreamEvent::Text("partial".into()),
        ])
        .hold_open(true);
        let chat = ChatSession::builder(Arc::new(transport))
            .agent("agent-1")
            .workspace("ws-1")
            .history(vec![ChatMessage::user("earlier question")])
            .build()
            .unwrap();
        let before = chat.snapshot();

        let mut rx = chat.subscribe();
        let runner = chat.clone();
        let task = tokio::spawn(async move { runner.send_message("long job").await });

        rx.wait_for(|s| {
            s.last_message()
                .is_some_and(|m| m.role == Role::Assistant && m.content == "partial")
        })
        .await
        .expect("assistant message published");
        assert!(chat.is_streaming());

        assert!(chat.cancel());
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("send_message returned")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);

        let after = chat.snapshot();
        assert_eq!(after.messages.len(), before.messages.len());
        assert!(Arc::ptr_eq(&after.messages[0], &before.messages[0]));
        assert_eq!(after.status, ChatStatus::Idle);
        assert_eq!(after.error, None);
        assert!(!chat.is_streaming());
        assert!(!chat.cancel());
    }

    #[tokio::test]
    async fn dropped_send_rolls_back_and_frees_the_session() {
        let transport = ReplayTransport::from_turns(vec![
            body(&[StreamEvent::Text("working".into())]),
            body(&[StreamEvent::Text("ok".into()), StreamEvent::Done { usage: None }]),
        ])
        .hold_open(true);
        let chat = ChatSession::builder(Arc::new(transport))
            .agent("agent-1")
            .workspace("ws-1")
            .history(vec![ChatMessage::user("earlier question")])
            .build()
            .unwrap();
        let before = chat.snapshot();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(100), chat.send_message("first")).await;
        assert!(timed_out.is_err());

        let snap = chat.snapshot();
        assert!(!chat.is_streaming());
        assert_eq!(snap.status, ChatStatus::Idle);
        assert_eq!(snap.error, None);
        assert_eq!(snap.messages.len(), before.messages.len());
        assert!(Arc::ptr_eq(&snap.messages[0], &before.messages[0]));
        assert!(snap.version > before.version);

        let outcome = tokio::time::timeout(Duration::from_secs(5), chat.send_message("second"))
            .await
            .expect("second turn finished")
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Completed { usage: None });
        let snap = chat.snapshot();
        assert_eq!(snap.messages.len(), 3);
        assert_eq!(snap.messages[1].content, "second");
        assert_eq!(snap.messages[2].content, "ok");
    }

    #[tokio::test]
    async fn cancelled_turn_logs_its_own_identity() {
        let transport = ReplayTransport::from_turns(vec![
            body(&[
                StreamEvent::Session {
                    session_id: "s1".into(),
                    conversation_id: Some("c1".into()),
                },
                StreamEvent::Done { usage: None },
            ]),
            body(&[StreamEvent::Text("still going".into())]),
        ])
        .hold_open(true);
        let sink = Arc::new(MemorySink::default());
        let chat = ChatSession::builder(Arc::new(transport))
            .agent("agent-1")
            .workspace("ws-1")
            .telemetry(sink.clone())
            .build()
            .unwrap();
        chat.send_message("one").await.unwrap();

        let mut rx = chat.subscribe();
        let runner = chat.clone();
        let task = tokio::spawn(async move { runner.send_message("two").await });
        rx.wait_for(|s| s.last_message().is_some_and(|m| m.content == "still going"))
            .await
            .expect("second turn streaming");
        assert!(chat.cancel());
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);

        let logs = sink.logs.lock().unwrap().clone();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].session_id.as_deref(), Some("s1"));
        assert_eq!(logs[1].outcome, "cancelled");
        // the second turn never announced a session of its own
        assert_eq!(logs[1].session_id, None);
        assert_eq!(logs[1].conversation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_ignored() {
        let transport = ReplayTransport::from_events(&[StreamEvent::Text("working".into())])
            .hold_open(true);
        let chat = session(Arc::new(transport));
        let mut rx = chat.subscribe();

        let runner = chat.clone();
        let task = tokio::spawn(async move { runner.send_message("first").await });
        rx.wait_for(|s| s.is_streaming()).await.expect("streaming");

        let outcome = chat.send_message("second").await.unwrap();
        assert_eq!(outcome, TurnOutcome::Ignored);
        let users = chat
            .snapshot()
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .count();
        assert_eq!(users, 1);

        chat.cancel();
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);
    }

    #[tokio::test]
    async fn blank_message_is_ignored_without_publishing() {
        let chat = session(Arc::new(ReplayTransport::from_events(&[])));
        assert_eq!(chat.send_message("   \n").await.unwrap(), TurnOutcome::Ignored);
        let snap = chat.snapshot();
        assert_eq!(snap.version, 0);
        assert!(snap.messages.is_empty());
    }

    #[tokio::test]
    async fn conversation_id_adopted_once_and_sent_on_next_turn() {
        let transport = Arc::new(ReplayTransport::from_turns(vec![
            body(&[
                StreamEvent::Session {
                    session_id: "s1".into(),
                    conversation_id: Some("c1".into()),
                },
                StreamEvent::Done { usage: Some(usage()) },
            ]),
            body(&[
                StreamEvent::Session {
                    session_id: "s2".into(),
                    conversation_id: Some("c2".into()),
                },
                StreamEvent::Done { usage: Some(usage()) },
            ]),
        ]));
        let recorder = Arc::new(Recorder::default());
        let chat = ChatSession::builder(transport.clone())
            .agent("agent-1")
            .workspace("ws-1")
            .observer(recorder.clone())
            .build()
            .unwrap();

        chat.send_message("one").await.unwrap();
        assert_eq!(chat.conversation_id().as_deref(), Some("c1"));
        chat.send_message("two").await.unwrap();

        let snap = chat.snapshot();
        assert_eq!(snap.conversation_id.as_deref(), Some("c1"));
        assert_eq!(snap.session_id.as_deref(), Some("s2"));
        assert_eq!(snap.total_usage.input_tokens, 10);
        assert_eq!(*recorder.conversations.lock().unwrap(), vec!["c1".to_string()]);

        let requests = transport.requests();
        assert_eq!(requests[0].conversation_id, None);
        assert_eq!(requests[1].conversation_id.as_deref(), Some("c1"));
        assert_eq!(requests[1].message, "two");
    }

    #[tokio::test]
    async fn known_conversation_is_not_replaced() {
        let transport = ReplayTransport::from_events(&[
            StreamEvent::Session {
                session_id: "s1".into(),
                conversation_id: Some("server-side".into()),
            },
            StreamEvent::Done { usage: None },
        ]);
        let recorder = Arc::new(Recorder::default());
        let chat = ChatSession::builder(Arc::new(transport))
            .agent("agent-1")
            .workspace("ws-1")
            .conversation(Some("mine".into()))
            .observer(recorder.clone())
            .build()
            .unwrap();
        chat.send_message("hello").await.unwrap();
        assert_eq!(chat.conversation_id().as_deref(), Some("mine"));
        assert!(recorder.conversations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_failure_sets_error_state() {
        let chat = session(Arc::new(BrokenTransport {
            before_error: vec![],
            fail_open: true,
        }));
        let err = chat.send_message("hi").await.unwrap_err();
        assert!(matches!(err, ChatStreamError::Unavailable { .. }));
        let snap = chat.snapshot();
        assert_eq!(snap.status, ChatStatus::Error);
        assert!(snap.error.is_some());
        assert_eq!(snap.messages.len(), 1);
        assert!(!chat.is_streaming());
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_message() {
        let chat = session(Arc::new(BrokenTransport {
            before_error: vec![StreamEvent::Text("so far".into())],
            fail_open: false,
        }));
        let err = chat.send_message("hi").await.unwrap_err();
        assert!(matches!(err, ChatStreamError::Transport(_)));
        let snap = chat.snapshot();
        assert_eq!(snap.status, ChatStatus::Error);
        assert_eq!(snap.last_message().unwrap().content, "so far");
    }

    #[tokio::test]
    async fn stream_ending_without_done_is_interrupted() {
        let transport = ReplayTransport::from_events(&[StreamEvent::Text("cut off".into())]);
        let chat = session(Arc::new(transport));
        let outcome = chat.send_message("hi").await.unwrap();
        assert_eq!(outcome, TurnOutcome::Interrupted);
        let snap = chat.snapshot();
        assert_eq!(snap.status, ChatStatus::Idle);
        assert_eq!(snap.last_message().unwrap().content, "cut off");
        assert_eq!(snap.last_usage, None);
    }

    #[tokio::test]
    async fn telemetry_records_each_turn() {
        let transport = ReplayTransport::from_events(&[
            StreamEvent::Session {
                session_id: "s1".into(),
                conversation_id: Some("c1".into()),
            },
            StreamEvent::ToolStart {
                tool_call_id: "t1".into(),
                tool_name: "fetch".into(),
                args: json!({}),
            },
            StreamEvent::ToolResult {
                tool_call_id: "t1".into(),
                result: None,
                success: false,
                duration_ms: None,
            },
            StreamEvent::Done { usage: Some(usage()) },
        ]);
        let sink = Arc::new(MemorySink::default());
        let chat = ChatSession::builder(Arc::new(transport))
            .agent("agent-1")
            .workspace("ws-1")
            .telemetry(sink.clone())
            .build()
            .unwrap();
        chat.send_message("go").await.unwrap();

        let logs = sink.logs.lock().unwrap().clone();
        assert_eq!(logs.len(), 1);
        let log = &logs[0];
        assert_eq!(log.outcome, "completed");
        assert_eq!(log.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(log.session_id.as_deref(), Some("s1"));
        assert_eq!(log.conversation_id.as_deref(), Some("c1"));
        assert_eq!(log.events, 4);
        assert_eq!(log.tokens_input, Some(5));
        assert_eq!(log.tool_calls, 1);
        assert_eq!(log.tool_errors, 1);
    }

    #[test]
    fn builder_requires_agent_and_workspace() {
        let t: Arc<dyn ChatTransport> = Arc::new(ReplayTransport::from_events(&[]));
        let err = ChatSession::builder(t.clone()).workspace("ws").build().err().unwrap();
        assert!(matches!(err, ChatStreamError::Validation(_)));
        let err = ChatSession::builder(t)
            .agent("a")
            .workspace("  ")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ChatStreamError::Validation(_)));
    }
}
