//! Server-Sent Events framing.
//!
//! Contract:
//! - A record ends at a blank line (`\n\n`, CRLF tolerated). Nothing is emitted
//!   for a record until its delimiter has been seen; a partial record stays
//!   buffered across reads.
//! - Each record must carry an `event:` line and at least one `data:` line,
//!   otherwise it is discarded. Comments (`:`) and unknown fields are ignored.
//! - Payloads that do not decode into a [`StreamEvent`] are skipped without
//!   surfacing an error, so newer servers can add event types freely.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::Stream;

use crate::error::CoreResult;
use crate::event::StreamEvent;

/// Raw chunks of a response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>;

/// One complete SSE record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseRecord {
    pub event: String,
    pub data: String,
}

impl SseRecord {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// Parse the text of one record (without its terminating blank line).
    pub fn parse(text: &str) -> Option<Self> {
        let mut event: Option<String> = None;
        let mut data: Option<String> = None;

        for line in text.split('\n') {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.trim_end().to_string()),
                "data" => match data.as_mut() {
                    Some(d) => {
                        d.push('\n');
                        d.push_str(value);
                    }
                    None => data = Some(value.to_string()),
                },
                // id:, retry:, anything newer
                _ => {}
            }
        }

        Some(Self {
            event: event.filter(|e| !e.is_empty())?,
            data: data?,
        })
    }

    /// Render the record in wire form, including the terminating blank line.
    pub fn encode(&self) -> String {
        let mut out = format!("event: {}\n", self.event);
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Incremental splitter from arbitrary byte chunks to [`SseRecord`]s.
///
/// Bytes are buffered undecoded so a multi-byte UTF-8 sequence split across
/// two reads is reassembled before the record text is built.
#[derive(Debug, Default)]
pub struct SseFramer {
    buf: Vec<u8>,
    // bytes of `buf` already searched for a delimiter
    scanned: usize,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every record completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseRecord> {
        self.buf
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut records = Vec::new();
        while let Some(idx) = self.find_delimiter() {
            let raw: Vec<u8> = self.buf.drain(..idx + 2).collect();
            self.scanned = 0;
            let text = String::from_utf8_lossy(&raw[..idx]);
            match SseRecord::parse(&text) {
                Some(rec) => records.push(rec),
                None => {
                    if !text.trim().is_empty() {
                        tracing::trace!(len = raw.len(), "dropping malformed sse record");
                    }
                }
            }
        }
        self.scanned = self.buf.len().saturating_sub(1);
        records
    }

    /// Bytes held back waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop any unterminated tail at end of stream. Returns how many
    /// non-whitespace-only bytes were discarded.
    pub fn discard_tail(&mut self) -> usize {
        let tail = std::mem::take(&mut self.buf);
        self.scanned = 0;
        if tail.iter().all(|b| b.is_ascii_whitespace()) {
            0
        } else {
            tail.len()
        }
    }

    fn find_delimiter(&self) -> Option<usize> {
        let start = self.scanned.min(self.buf.len());
        self.buf[start..]
            .windows(2)
            .position(|w| w == b"\n\n")
            .map(|p| p + start)
    }
}

/// Adapts a response body into decoded [`StreamEvent`]s.
pub struct EventStream {
    inner: ByteStream,
    framer: SseFramer,
    ready: VecDeque<StreamEvent>,
    finished: bool,
}

impl EventStream {
    pub fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            framer: SseFramer::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    fn absorb(&mut self, chunk: &[u8]) {
        for rec in self.framer.push(chunk) {
            match StreamEvent::decode(&rec) {
                Some(ev) => self.ready.push_back(ev),
                None => tracing::trace!(event = %rec.event, "skipping undecodable sse record"),
            }
        }
    }
}

impl Stream for EventStream {
    type Item = CoreResult<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(ev) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(ev)));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.absorb(&chunk);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    this.ready.clear();
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    let dropped = this.framer.discard_tail();
                    if dropped > 0 {
                        tracing::debug!(bytes = dropped, "stream ended inside an sse record");
                    }
                    continue;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
