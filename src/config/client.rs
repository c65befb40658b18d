use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for reaching the control-plane API and pacing reports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Name of the node object this daemon reports on
    pub node_name: String,
    /// Base URL of the API server
    pub api_server: String,
    /// Namespace events are posted to
    pub event_namespace: String,
    /// File holding a bearer token, re-read on every client build
    pub token_file: Option<PathBuf>,
    /// Per-call timeout
    pub request_timeout_ms: u64,
    /// First condition retry delay
    pub backoff_base_ms: u64,
    /// Upper bound for the condition retry delay
    pub backoff_max_ms: u64,
    /// Fraction of the nominal delay added as random jitter
    pub backoff_jitter: f64,
    /// Attempts per event before it is dropped
    pub event_max_attempts: u32,
    /// Fixed pause between event attempts
    pub event_retry_delay_ms: u64,
    /// Events allowed per minute; extra events are dropped
    pub event_rate_per_minute: usize,
    /// Condition uploads allowed per minute; extra uploads wait
    pub condition_rate_per_minute: usize,
    /// Events buffered between the detector and the API
    pub event_queue_capacity: usize,
    /// Pending condition types above which the backlog is logged
    pub backlog_warn_threshold: usize,
    /// Period for re-uploading all conditions to refresh heartbeats
    pub heartbeat_period_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            api_server: "https://kubernetes.default.svc".to_string(),
            event_namespace: "default".to_string(),
            token_file: None,
            request_timeout_ms: 10_000,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.2,
            event_max_attempts: 3,
            event_retry_delay_ms: 200,
            event_rate_per_minute: 30,
            condition_rate_per_minute: 60,
            event_queue_capacity: 100,
            backlog_warn_threshold: 32,
            heartbeat_period_secs: 300,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn event_retry_delay(&self) -> Duration {
        Duration::from_millis(self.event_retry_delay_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "node name must not be empty".to_string(),
            ));
        }
        if self.api_server.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "api server must not be empty".to_string(),
            ));
        }
        if self.backoff_base_ms == 0 || self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::ValidationError(
                "backoff_base_ms must be positive and not exceed backoff_max_ms".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat_period_secs == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat_period_secs must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::ValidationError(
                "backoff_jitter must be between 0 and 1".to_string(),
            ));
        }
        if self.event_max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "event_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "event_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.event_rate_per_minute == 0 || self.condition_rate_per_minute == 0 {
            return Err(ConfigError::ValidationError(
                "rate limits must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
