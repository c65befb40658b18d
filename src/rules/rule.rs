//! Rule configuration and compiled rules
//!
//! A rule pairs a regular expression with the problem it identifies. Rules
//! are compiled once at load time; a rule that fails to compile rejects the
//! whole configuration.

use crate::error::ConfigError;
use crate::types::Severity;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Result class of a plugin run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Exit code 0
    Ok,
    /// Exit code 1
    NonOk,
    /// Any other exit code, a signal, or a timeout
    Unknown,
}

impl ExitStatus {
    /// Map a process exit code to a result class
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitStatus::Ok,
            Some(1) => ExitStatus::NonOk,
            _ => ExitStatus::Unknown,
        }
    }
}

/// Rule as written in a monitor configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleConfig {
    /// Whether the problem is a standing condition or a one-off event
    #[serde(rename = "type")]
    pub severity: Severity,
    /// Condition type set by a permanent rule
    #[serde(default)]
    pub condition: Option<String>,
    /// Reason attached to the condition or event
    pub reason: String,
    /// Regular expression matched against the log line or plugin output
    pub pattern: String,
    /// Message template; `$1`, `${name}` expand to capture groups
    #[serde(default)]
    pub message: Option<String>,
    /// Plugin result class this rule applies to (plugin monitors only)
    #[serde(default)]
    pub exit_status: Option<ExitStatus>,
}

/// Input handed to the rule engine by a monitor
#[derive(Debug, Clone, Copy)]
pub enum RuleInput<'a> {
    /// One line of a log source
    Line(&'a str),
    /// Result of one plugin run
    Plugin {
        exit_status: ExitStatus,
        output: &'a str,
    },
}

impl<'a> RuleInput<'a> {
    fn text(&self) -> &'a str {
        match self {
            RuleInput::Line(line) => line,
            RuleInput::Plugin { output, .. } => output,
        }
    }
}

/// Problem identified by a matching rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub condition_type: Option<String>,
    pub severity: Severity,
    pub reason: String,
    pub message: String,
}

/// A rule with its pattern compiled
#[derive(Debug, Clone)]
pub struct Rule {
    severity: Severity,
    condition_type: Option<String>,
    reason: String,
    pattern: Regex,
    message_template: Option<String>,
    exit_status: Option<ExitStatus>,
}

impl Rule {
    /// Compile and validate a configured rule
    pub fn compile(config: &RuleConfig) -> Result<Self, ConfigError> {
        if config.reason.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "rule with pattern {:?} has an empty reason",
                config.pattern
            )));
        }

        let condition_type = config
            .condition
            .as_ref()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if config.severity == Severity::Permanent && condition_type.is_none() {
            return Err(ConfigError::ValidationError(format!(
                "permanent rule {:?} must name a condition",
                config.reason
            )));
        }

        let pattern = Regex::new(&config.pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: config.pattern.clone(),
            source,
        })?;

        Ok(Self {
            severity: config.severity,
            condition_type,
            reason: config.reason.clone(),
            pattern,
            message_template: config.message.clone(),
            exit_status: config.exit_status,
        })
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn condition_type(&self) -> Option<&str> {
        self.condition_type.as_deref()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Try to match this rule against an input
    ///
    /// Plugin inputs only match rules for the same exit status; a rule
    /// without an explicit `exit_status` applies to `non_ok` runs.
    pub fn classify(&self, input: &RuleInput<'_>) -> Option<Classification> {
        if let RuleInput::Plugin { exit_status, .. } = input {
            if self.exit_status.unwrap_or(ExitStatus::NonOk) != *exit_status {
                return None;
            }
        }

        let text = input.text();
        let captures = self.pattern.captures(text)?;
        let message = match &self.message_template {
            Some(template) => {
                let mut expanded = String::new();
                captures.expand(template, &mut expanded);
                expanded
            }
            None => text.trim().to_string(),
        };

        Some(Classification {
            condition_type: self.condition_type.clone(),
            severity: self.severity,
            reason: self.reason.clone(),
            message,
        })
    }
}
