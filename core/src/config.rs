//! Client, pipeline and event loop configuration.
//!
//! `ClientConfig` is what a host application ships (usually as JSON next to
//! its build); the other two are tuning knobs with production defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Credentials and endpoint of the game backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub api_key: String,
    pub api_secret: String,
    /// Base URL; may contain the `[id]` load-balancer placeholder.
    pub server_url: String,
    pub load_balancer_count: u32,
    pub http_timeout_ms: u64,
    pub user_agent: String,
    pub sdk_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            server_url: "https://sandbox-api[id].gamecloud.example".to_string(),
            load_balancer_count: 2,
            http_timeout_ms: 60_000,
            user_agent: format!("gamecloud-rust/{SDK_VERSION}"),
            sdk_version: SDK_VERSION.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new(api_key: &str, api_secret: &str, server_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            server_url: server_url.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let mut config: ClientConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.server_url = config.server_url.trim_end_matches('/').to_string();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("api key is required".to_string()));
        }
        if self.api_secret.trim().is_empty() {
            return Err(ConfigError::Invalid("api secret is required".to_string()));
        }
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server url is required".to_string()));
        }
        if self.load_balancer_count == 0 {
            return Err(ConfigError::Invalid(
                "load balancer count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// Retry tuning of a `RequestPipeline`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Wait before retry `n` is `backoff_schedule[n]`. Its length is the
    /// maximum number of retries; empty disables retrying.
    pub backoff_schedule: Vec<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let ms = [100, 100, 100, 150, 300, 300, 500, 500, 500, 1000, 1000, 2000];
        Self {
            backoff_schedule: ms.into_iter().map(Duration::from_millis).collect(),
        }
    }
}

impl PipelineConfig {
    pub fn with_schedule(backoff_schedule: Vec<Duration>) -> Self {
        Self { backoff_schedule }
    }

    pub fn no_retries() -> Self {
        Self::with_schedule(Vec::new())
    }
}

/// Timing of a `DomainEventLoop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLoopConfig {
    /// How long the server may hold a poll open.
    pub long_poll_timeout: Duration,
    /// Pause after a failed iteration before polling again.
    pub failure_cooldown: Duration,
    /// Added to `long_poll_timeout` to form the client-side deadline.
    pub request_grace: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout: Duration::from_secs(590),
            failure_cooldown: Duration::from_secs(20),
            request_grace: Duration::from_secs(30),
        }
    }
}

impl EventLoopConfig {
    pub fn request_timeout(&self) -> Duration {
        self.long_poll_timeout + self.request_grace
    }
}
