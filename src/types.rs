//! Core problem types shared by monitors, the detector and the client
//!
//! Monitors emit [`Status`] batches made of [`Condition`] updates and [`Event`]s.
//! Conditions are durable node state keyed by type; events are append-only
//! occurrences.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Status of a node condition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    /// The problem is present
    True,
    /// The problem is absent
    False,
    /// Detection state cannot be confirmed
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Durable node-level health fact, unique per `condition_type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Unique key of the condition (e.g. "KernelDeadlock")
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Current status
    pub status: ConditionStatus,
    /// When the status last changed
    pub transition_time: Timestamp,
    /// Short CamelCase reason
    pub reason: String,
    /// Human readable detail
    pub message: String,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        transition_time: Timestamp,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            transition_time,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Whether reason and message are the same as `other`'s
    pub fn same_detail(&self, other: &Condition) -> bool {
        self.reason == other.reason && self.message == other.message
    }
}

/// Severity of an emitted event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Ephemeral occurrence record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
    pub timestamp: Timestamp,
    /// Name of the monitor that observed the occurrence
    pub source: String,
}

impl Event {
    pub fn warning(
        source: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            severity: EventSeverity::Warning,
            reason: reason.into(),
            message: message.into(),
            timestamp,
            source: source.into(),
        }
    }
}

/// Problem severity assigned by a rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// One-off occurrence, reported as an event only
    Temporary,
    /// Standing node state, reported as a condition
    Permanent,
}

/// One observation from a monitor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub source: String,
    pub timestamp: Timestamp,
    pub conditions: Vec<Condition>,
    pub events: Vec<Event>,
}

impl Status {
    pub fn new(source: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            source: source.into(),
            timestamp,
            conditions: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_serializes_with_api_field_names() {
        let condition = Condition::new(
            "KernelDeadlock",
            ConditionStatus::True,
            "DockerHung",
            "task docker:7 blocked for more than 120 seconds",
            Utc::now(),
        );

        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "KernelDeadlock");
        assert_eq!(json["status"], "True");
        assert!(json.get("transitionTime").is_some());
    }

    #[test]
    fn test_same_detail() {
        let now = Utc::now();
        let a = Condition::new("A", ConditionStatus::True, "R", "m", now);
        let mut b = a.clone();
        b.status = ConditionStatus::False;
        assert!(a.same_detail(&b));
        b.message = "other".to_string();
        assert!(!a.same_detail(&b));
    }

    #[test]
    fn test_severity_serialization() {
        assert_eq!(
            serde_json::to_string(&Severity::Permanent).unwrap(),
            "\"permanent\""
        );
        assert_eq!(
            serde_json::to_string(&Severity::Temporary).unwrap(),
            "\"temporary\""
        );
    }

    #[test]
    fn test_empty_status() {
        let mut status = Status::new("kernel-monitor", Utc::now());
        assert!(status.is_empty());
        status.events.push(Event::warning(
            "kernel-monitor",
            "OOMKilling",
            "killed process 12",
            Utc::now(),
        ));
        assert!(!status.is_empty());
    }
}
