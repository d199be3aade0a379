use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};

use crate::config::Config;
use crate::error::{ChatStreamError, CoreResult};
use crate::event::StreamEvent;
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::ChatRequest;
use crate::sse::{ByteStream, EventStream};

/// Boxed stream of decoded events for one turn.
pub type BoxEventStream = BoxStream<'static, CoreResult<StreamEvent>>;

/// A turn's event stream plus whatever the transport learned while opening it.
pub struct OpenedStream {
    pub events: BoxEventStream,
    pub upstream_request_id: Option<String>,
}

/// Source of chat event streams. One `open` call per turn.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn name(&self) -> &str;
    async fn open(&self, req: &ChatRequest, turn_id: &str) -> CoreResult<OpenedStream>;
}

/// Streams turns from the HTTP chat endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
    url: String,
    api_key: Option<SecretString>,
}

impl HttpTransport {
    pub fn new(http: HttpClient, url: impl Into<String>, api_key: Option<SecretString>) -> Self {
        Self {
            http,
            url: url.into(),
            api_key,
        }
    }

    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        cfg.validate()?;
        Ok(Self::new(
            HttpClient::new(&cfg.http)?,
            cfg.endpoint.url.clone(),
            cfg.endpoint.api_key()?,
        ))
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut h = Vec::new();
        if let Some(key) = &self.api_key {
            h.push((
                "Authorization".to_string(),
                format!("Bearer {}", key.expose_secret()),
            ));
        }
        h
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn open(&self, req: &ChatRequest, turn_id: &str) -> CoreResult<OpenedStream> {
        let ctx = RequestCtx {
            request_id: Some(turn_id),
            idempotency_key: Some(turn_id),
        };
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let (body, upstream_request_id) = self
            .http
            .post_event_stream(&self.url, req, &hdrs, &ctx)
            .await?;
        Ok(OpenedStream {
            events: EventStream::new(body).boxed(),
            upstream_request_id,
        })
    }
}

/// Replays captured `text/event-stream` bodies instead of calling a server.
///
/// Each `open` consumes the next scripted body; once the script is exhausted
/// the last body is replayed again. Bodies are cut into `chunk_size` pieces so
/// record boundaries rarely line up with reads, as on a real connection.
pub struct ReplayTransport {
    turns: Mutex<VecDeque<Bytes>>,
    last: Mutex<Bytes>,
    chunk_size: usize,
    hold_open: bool,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ReplayTransport {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self::from_turns(vec![body.into()])
    }

    pub fn from_turns(turns: Vec<Bytes>) -> Self {
        let last = turns.last().cloned().unwrap_or_default();
        Self {
            turns: Mutex::new(turns.into()),
            last: Mutex::new(last),
            chunk_size: 64,
            hold_open: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_events(events: &[StreamEvent]) -> Self {
        let body: String = events.iter().map(|e| e.to_record().encode()).collect();
        Self::new(body)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(ChatStreamError::from)?;
        Ok(Self::new(bytes))
    }

    pub fn chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n.max(1);
        self
    }

    /// Keep the stream pending after the body is exhausted instead of ending
    /// it, like a server that stalls mid-turn.
    pub fn hold_open(mut self, yes: bool) -> Self {
        self.hold_open = yes;
        self
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn next_body(&self) -> CoreResult<Bytes> {
        let mut turns = self.turns.lock().map_err(poisoned)?;
        let mut last = self.last.lock().map_err(poisoned)?;
        if let Some(body) = turns.pop_front() {
            *last = body;
        }
        Ok(last.clone())
    }
}

fn poisoned<T>(_: T) -> ChatStreamError {
    ChatStreamError::Other(anyhow::anyhow!("replay transport lock poisoned"))
}

#[async_trait]
impl ChatTransport for ReplayTransport {
    fn name(&self) -> &str {
        "replay"
    }

    async fn open(&self, req: &ChatRequest, _turn_id: &str) -> CoreResult<OpenedStream> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(req.clone());
        }
        let body = self.next_body()?;
        let chunks: Vec<CoreResult<Bytes>> = (0..body.len())
            .step_by(self.chunk_size)
            .map(|start| Ok(body.slice(start..(start + self.chunk_size).min(body.len()))))
            .collect();
        let replay = futures::stream::iter(chunks);
        let bytes: ByteStream = if self.hold_open {
            Box::pin(replay.chain(futures::stream::pending()))
        } else {
            Box::pin(replay)
        };
        Ok(OpenedStream {
            events: EventStream::new(bytes).boxed(),
            upstream_request_id: None,
        })
    }
}
