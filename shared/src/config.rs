use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::capabilities::http::{DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS};

pub const ENV_API_BASE_URL: &str = "API_BASE_URL";
pub const ENV_WS_BASE_URL: &str = "WS_BASE_URL";
pub const ENV_API_TIMEOUT: &str = "API_TIMEOUT";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    InvalidUrl { field: &'static str, reason: String },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub request_timeout_ms: u64,
    pub payment_poll_attempts: u32,
    pub payment_poll_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: crate::DEFAULT_API_BASE_URL.to_string(),
            ws_base_url: crate::DEFAULT_WS_BASE_URL.to_string(),
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            payment_poll_attempts: crate::PAYMENT_POLL_ATTEMPTS,
            payment_poll_interval_ms: 2_000,
            reconnect_base_ms: crate::RECONNECT_BASE_DELAY_MS,
            reconnect_max_ms: crate::RECONNECT_MAX_DELAY_MS,
            reconnect_max_attempts: crate::RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `API_BASE_URL`, `WS_BASE_URL` and `API_TIMEOUT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_API_BASE_URL).filter(|v| !v.trim().is_empty()) {
            config.api_base_url = url.trim().to_string();
        }
        if let Some(url) = lookup(ENV_WS_BASE_URL).filter(|v| !v.trim().is_empty()) {
            config.ws_base_url = url.trim().to_string();
        }
        if let Some(timeout) = lookup(ENV_API_TIMEOUT).filter(|v| !v.trim().is_empty()) {
            config.request_timeout_ms =
                timeout
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        field: ENV_API_TIMEOUT,
                        reason: format!("'{timeout}' is not a number of milliseconds"),
                    })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("api_base_url", &self.api_base_url, &["http", "https"])?;
        check_url("ws_base_url", &self.ws_base_url, &["ws", "wss"])?;

        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_TIMEOUT_MS {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: format!("must be between 1 and {MAX_TIMEOUT_MS}"),
            });
        }
        if self.payment_poll_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "payment_poll_attempts",
                reason: "must be > 0".into(),
            });
        }
        if self.reconnect_base_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect_base_ms",
                reason: "must be > 0".into(),
            });
        }
        if self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect_max_ms",
                reason: "must be >= reconnect_base_ms".into(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn payment_poll_interval(&self) -> Duration {
        Duration::from_millis(self.payment_poll_interval_ms)
    }

    /// `path` is relative to the versioned API root, e.g. `/order/42/accept`.
    pub fn api_url(&self, path: &str) -> Result<Url, ConfigError> {
        let joined = format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| ConfigError::InvalidUrl {
            field: "api_base_url",
            reason: e.to_string(),
        })
    }

    pub fn ws_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.ws_base_url).map_err(|e| ConfigError::InvalidUrl {
            field: "ws_base_url",
            reason: e.to_string(),
        })
    }
}

fn check_url(field: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidUrl {
            field,
            reason: "must not be empty".into(),
        });
    }
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field,
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            field,
            reason: format!("scheme '{}' not allowed", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            reason: "missing host".into(),
        });
    }
    Ok(())
}
