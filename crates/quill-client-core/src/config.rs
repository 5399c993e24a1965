use std::env;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9000";
pub const DEFAULT_TOKEN_ENDPOINT: &str = "/api/csrf-token";
pub const DEFAULT_TOKEN_HEADER: &str = "x-csrf-token";
pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 3600;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_STREAM_MAX_RETRIES: u32 = 3;
pub const DEFAULT_STREAM_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_STREAM_MAX_DELAY_MS: u64 = 15_000;
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 30_000;

pub const ENV_BASE_URL: &str = "QUILL_BASE_URL";
pub const ENV_TOKEN_TTL_SECONDS: &str = "QUILL_TOKEN_TTL_SECONDS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "QUILL_REQUEST_TIMEOUT_MS";
pub const ENV_STREAM_MAX_RETRIES: &str = "QUILL_STREAM_MAX_RETRIES";
pub const ENV_STREAM_BASE_DELAY_MS: &str = "QUILL_STREAM_BASE_DELAY_MS";
pub const ENV_STREAM_MAX_DELAY_MS: &str = "QUILL_STREAM_MAX_DELAY_MS";
pub const ENV_STALL_TIMEOUT_MS: &str = "QUILL_STALL_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("base url must use http:// or https:// and include a host")]
    InvalidBaseUrl,
}

/// Client-wide settings. Constructed explicitly so tests can build isolated
/// instances with short timeouts and tiny backoff windows.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Normalized: trimmed, no trailing slash.
    pub base_url: String,
    pub token_endpoint: String,
    pub token_header: String,
    pub token_ttl_ms: u64,
    pub request_timeout: Duration,
    pub stream_max_retries: u32,
    pub stream_base_delay: Duration,
    pub stream_max_delay: Duration,
    pub stall_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: normalize_base_url(base_url.as_ref())?,
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            token_header: DEFAULT_TOKEN_HEADER.to_string(),
            token_ttl_ms: DEFAULT_TOKEN_TTL_SECONDS * 1000,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            stream_max_retries: DEFAULT_STREAM_MAX_RETRIES,
            stream_base_delay: Duration::from_millis(DEFAULT_STREAM_BASE_DELAY_MS),
            stream_max_delay: Duration::from_millis(DEFAULT_STREAM_MAX_DELAY_MS),
            stall_timeout: Duration::from_millis(DEFAULT_STALL_TIMEOUT_MS),
        })
    }

    /// Build from `QUILL_*` environment variables. Unset variables use
    /// defaults; unparseable values are logged and fall back rather than
    /// aborting startup.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = env_non_empty(ENV_BASE_URL).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut config = Self::new(base_url)?;

        if let Some(ttl) = env_parsed::<u64>(ENV_TOKEN_TTL_SECONDS) {
            config.token_ttl_ms = ttl * 1000;
        }
        if let Some(timeout) = env_parsed::<u64>(ENV_REQUEST_TIMEOUT_MS) {
            config.request_timeout = Duration::from_millis(timeout);
        }
        if let Some(retries) = env_parsed::<u32>(ENV_STREAM_MAX_RETRIES) {
            config.stream_max_retries = retries;
        }
        if let Some(base) = env_parsed::<u64>(ENV_STREAM_BASE_DELAY_MS) {
            config.stream_base_delay = Duration::from_millis(base);
        }
        if let Some(max) = env_parsed::<u64>(ENV_STREAM_MAX_DELAY_MS) {
            config.stream_max_delay = Duration::from_millis(max);
        }
        if let Some(stall) = env_parsed::<u64>(ENV_STALL_TIMEOUT_MS) {
            config.stall_timeout = Duration::from_millis(stall);
        }

        Ok(config)
    }
}

pub fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyBaseUrl);
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::InvalidBaseUrl);
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(ConfigError::InvalidBaseUrl);
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(ConfigError::InvalidBaseUrl);
    }
    Ok(trimmed.to_string())
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_non_empty(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
