use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::gemini::FALLBACK_MODEL;

// ── Constants ────────────────────────────────────────────────────────────────

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY is not set")]
    MissingApiKey,
    #[error("GEMINI_TIMEOUT_SECS must be a positive integer, got {0:?}")]
    InvalidTimeout(String),
    #[error("BIND_ADDR is not a valid socket address: {0:?}")]
    InvalidBindAddr(String),
}

// ── Settings ─────────────────────────────────────────────────────────────────

/// Process settings, resolved once in `main` and shared read-only afterwards.
#[derive(Clone)]
pub struct Settings {
    pub api_key: String,
    /// Configured model identifier. `None` means "use the fallback model".
    pub model_name: Option<String>,
    pub base_url: String,
    pub request_timeout: Duration,
    pub bind_addr: SocketAddr,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &"<redacted>")
            .field("model_name", &self.model_name)
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| -> Option<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = get("GEMINI_API_KEY").ok_or(ConfigError::MissingApiKey)?;

        let request_timeout = match get("GEMINI_TIMEOUT_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => return Err(ConfigError::InvalidTimeout(raw)),
            },
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        let bind_raw = get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidBindAddr(bind_raw.clone()))?;

        Ok(Self {
            api_key,
            model_name: get("GEMINI_MODEL_NAME"),
            base_url: get("GEMINI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            request_timeout,
            bind_addr,
        })
    }

    /// The model identifier to try first.
    pub fn resolved_model_name(&self) -> &str {
        self.model_name.as_deref().unwrap_or(FALLBACK_MODEL)
    }
}
