/// Error types for monitors, configuration and the API client
pub mod error;

/// Conditions, events and statuses
pub mod types;

/// Rule matching for log lines and plugin output
pub mod rules;

/// Configuration management
pub mod config;

/// Log and plugin monitors
pub mod monitors;

/// Merging and deduplication of monitor output
pub mod detector;

/// Control-plane API client and reporter
pub mod client;

// Re-export commonly used types
pub use error::{ClientError, ConfigError, MonitorError};
pub use types::{Condition, ConditionStatus, Event, EventSeverity, Severity, Status, Timestamp};
