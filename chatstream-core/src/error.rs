use thiserror::Error;

/// Core error type for chatstream.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum ChatStreamError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited by {endpoint}")]
    RateLimited {
        endpoint: String,
        retry_after: Option<u64>,
    },

    #[error("chat endpoint unavailable: {endpoint}")]
    Unavailable { endpoint: String },

    #[error("upstream error from {endpoint}: {code} {message}")]
    Upstream {
        endpoint: String,
        code: String,
        message: String,
    },

    /// The response body failed mid-stream (connection reset, read timeout).
    #[error("stream transport failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChatStreamError {
    /// Short, stable label for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable { .. } => "unavailable",
            Self::Upstream { .. } => "upstream",
            Self::Transport(_) => "transport",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, ChatStreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = ChatStreamError::Upstream {
            endpoint: "http".into(),
            code: "400".into(),
            message: "bad agent".into(),
        };
        assert_eq!(err.to_string(), "upstream error from http: 400 bad agent");
        assert_eq!(err.kind(), "upstream");
    }

    #[test]
    fn anyhow_converts_to_other() {
        let err: ChatStreamError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, ChatStreamError::Other(_)));
        assert_eq!(err.kind(), "other");
    }
}
