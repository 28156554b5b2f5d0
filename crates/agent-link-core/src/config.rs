//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::heartbeat::HeartbeatConfig;

/// Configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

const fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

const fn default_heartbeat_grace_ms() -> u64 {
    1000
}

const fn default_connect_timeout_ms() -> u64 {
    5000
}

const fn default_ack_timeout_ms() -> u64 {
    5000
}

const fn default_answer_timeout_ms() -> u64 {
    15_000
}

/// Where the backend lives and how patient to be with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Base URL of the HTTP API, e.g. `https://bot.example.com/api`.
    pub api_base: String,

    /// Chat socket URL. Derived from `api_base` when absent.
    #[serde(default)]
    pub socket_url: Option<String>,

    /// Call signaling socket URL. Derived from `api_base` when absent.
    #[serde(default)]
    pub signaling_url: Option<String>,

    /// Opaque bearer credential.
    #[serde(default)]
    pub credential: Option<String>,

    /// Caller identity used to list previous sessions.
    #[serde(default)]
    pub external_id: Option<String>,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_grace_ms")]
    pub heartbeat_grace_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_answer_timeout_ms")]
    pub answer_timeout_ms: u64,
}

impl ClientConfig {
    /// Configuration with default timings.
    #[must_use]
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            socket_url: None,
            signaling_url: None,
            credential: None,
            external_id: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_grace_ms: default_heartbeat_grace_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            answer_timeout_ms: default_answer_timeout_ms(),
        }
    }

    /// Load from `AGENT_LINK_*` environment variables.
    ///
    /// # Errors
    /// Returns error if `AGENT_LINK_API_BASE` is missing, a timing value
    /// is not a number, or the heartbeat interval is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_base = lookup("AGENT_LINK_API_BASE")
            .ok_or_else(|| ConfigError::MissingVar("AGENT_LINK_API_BASE".to_string()))?;

        let mut config = Self::new(api_base);
        config.socket_url = lookup("AGENT_LINK_SOCKET_URL");
        config.signaling_url = lookup("AGENT_LINK_SIGNALING_URL");
        config.credential = lookup("AGENT_LINK_CREDENTIAL");
        config.external_id = lookup("AGENT_LINK_EXTERNAL_ID");

        for (var, slot) in [
            ("AGENT_LINK_HEARTBEAT_INTERVAL_MS", &mut config.heartbeat_interval_ms),
            ("AGENT_LINK_HEARTBEAT_GRACE_MS", &mut config.heartbeat_grace_ms),
            ("AGENT_LINK_CONNECT_TIMEOUT_MS", &mut config.connect_timeout_ms),
            ("AGENT_LINK_ACK_TIMEOUT_MS", &mut config.ack_timeout_ms),
            ("AGENT_LINK_ANSWER_TIMEOUT_MS", &mut config.answer_timeout_ms),
        ] {
            if let Some(raw) = lookup(var) {
                *slot = raw
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(var.to_string(), raw.clone()))?;
            }
        }

        // A zero period cannot drive the heartbeat timer.
        if config.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "AGENT_LINK_HEARTBEAT_INTERVAL_MS".to_string(),
                "0".to_string(),
            ));
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    #[must_use]
    pub fn with_socket_url(mut self, url: impl Into<String>) -> Self {
        self.socket_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    #[must_use]
    pub const fn with_heartbeat(mut self, interval_ms: u64, grace_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self.heartbeat_grace_ms = grace_ms;
        self
    }

    #[must_use]
    pub const fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            grace: Duration::from_millis(self.heartbeat_grace_ms),
        }
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    #[must_use]
    pub const fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }
}
