use thiserror::Error;

/// Errors raised while monitors observe their sources
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Plugin terminated unexpectedly: {0}")]
    SubprocessTerminated(String),

    #[error("Log source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Monitor already started: {0}")]
    AlreadyStarted(String),

    #[error("Failed to start monitor thread: {0}")]
    ThreadSpawn(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors returned by the control-plane API client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Stale resource version, node object was modified concurrently")]
    Conflict,

    #[error("Network failure: {0}")]
    Network(String),

    #[error("API returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Request timeout")]
    Timeout,

    #[error("Invalid response format: {0}")]
    Decode(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Failed to set up API client: {0}")]
    Setup(String),
}

impl ClientError {
    /// Whether retrying the same call could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Conflict
            | ClientError::Network(_)
            | ClientError::Timeout
            | ClientError::RateLimited => true,
            ClientError::Api { status, .. } => *status == 429 || *status >= 500,
            ClientError::Decode(_) | ClientError::Setup(_) => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ClientError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("Invalid rule pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Condition type {condition_type:?} is claimed by both {first} and {second}")]
    DuplicateConditionType {
        condition_type: String,
        first: String,
        second: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}
