use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{ChatStreamError, CoreResult};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EndpointCfg {
    /// Full URL of the streaming chat endpoint, e.g. https://app.example.com/api/agents/chat
    pub url: String,
    /// Name of the environment variable that contains the bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl EndpointCfg {
    /// Resolve the bearer token. A configured but unset variable is an error;
    /// no variable configured means an unauthenticated endpoint.
    pub fn api_key(&self) -> CoreResult<Option<SecretString>> {
        let Some(var) = self.api_key_env.as_deref() else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => Ok(Some(SecretString::from(v))),
            _ => Err(ChatStreamError::Validation(format!(
                "environment variable '{var}' is not set"
            ))),
        }
    }
}

/// Defaults for the session identity; CLI flags override these.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct ChatCfg {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds. Unset by default: a turn may
    /// stream for as long as the agent keeps working.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: None,
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    pub endpoint: EndpointCfg,
    #[serde(default)]
    pub chat: ChatCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(ChatStreamError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| ChatStreamError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| ChatStreamError::Other(e.into()))?
            }
            Some("toml") => {
                toml::from_str::<Self>(s).map_err(|e| ChatStreamError::Other(e.into()))?
            }
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| ChatStreamError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s).map_err(|e| ChatStreamError::Other(e.into()))
                })?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        let url = self.endpoint.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ChatStreamError::Validation(format!(
                "endpoint url must be http(s): '{url}'"
            )));
        }
        Ok(())
    }
}
