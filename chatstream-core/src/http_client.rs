use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::config::HttpCfg;
use crate::error::{ChatStreamError, CoreResult};
use crate::sse::ByteStream;

/// Request context carries tracing IDs and idempotency key.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub request_id: Option<&'a str>,
    pub idempotency_key: Option<&'a str>,
}

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(ms) = cfg.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| ChatStreamError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("chatstream/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    /// POST JSON and return the raw `text/event-stream` body together with the
    /// upstream request id, if the server sent one.
    ///
    /// Non-2xx statuses are mapped to errors before any body is streamed.
    pub async fn post_event_stream<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(ByteStream, Option<String>)> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");

        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }
        if let Some(ik) = ctx.idempotency_key {
            req = req.header("Idempotency-Key", ik);
        }

        let resp = req.send().await.map_err(|e| {
            tracing::debug!(error = %e, "chat request failed to connect");
            ChatStreamError::Unavailable {
                endpoint: "http".into(),
            }
        })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        if !status.is_success() {
            let ra = parse_retry_after(&headers);
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error("http", status, ra, &body));
        }
        let upstream_id = extract_request_id(&headers);

        let body: ByteStream = Box::pin(
            resp.bytes_stream()
                .map_err(|e| ChatStreamError::Transport(e.to_string())),
        );
        Ok((body, upstream_id))
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 4] = [
        "x-request-id",
        "request-id",
        "x-vercel-id",
        "x-amzn-requestid",
    ];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

fn map_http_error(
    endpoint: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> ChatStreamError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ChatStreamError::RateLimited {
            endpoint: endpoint.to_string(),
            retry_after,
        },
        s if s.is_server_error() => ChatStreamError::Unavailable {
            endpoint: endpoint.to_string(),
        },
        s => ChatStreamError::Upstream {
            endpoint: endpoint.to_string(),
            code: s.as_u16().to_string(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut t = s[..cut].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}
