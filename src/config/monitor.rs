//! Monitor configuration files
//!
//! Each monitor instance is described by one file, TOML or JSON, chosen by
//! extension. Everything here is immutable once loaded.

use crate::error::ConfigError;
use crate::rules::{RuleConfig, RuleEngine};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Condition reset to `False` when a monitor starts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefaultCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub reason: String,
    pub message: String,
}

/// Configuration of a log monitor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogMonitorConfig {
    /// Monitor name, used as the source of emitted statuses
    pub source: String,
    /// Log file to follow
    pub log_path: PathBuf,
    /// Skip content already present when the file is first opened
    #[serde(default = "default_true")]
    pub start_at_end: bool,
    /// Number of trailing lines to replay when starting at the end
    #[serde(default)]
    pub lookback_lines: usize,
    /// How often to look for new lines
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive open/read failures before detection is reported degraded
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// First reopen delay after a source failure
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Upper bound for the reopen delay
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Condition type reporting whether this monitor can read its source
    #[serde(default)]
    pub health_condition: Option<String>,
    #[serde(default)]
    pub default_conditions: Vec<DefaultCondition>,
    pub rules: Vec<RuleConfig>,
}

impl LogMonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    /// Condition type used to surface source unavailability
    pub fn health_condition_type(&self) -> String {
        health_condition_type(&self.source, self.health_condition.as_deref())
    }

    /// Check values that deserialization cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_source(&self.source)?;
        if self.log_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{}: log_path must not be empty",
                self.source
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: poll_interval_ms must be greater than 0",
                self.source
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: max_consecutive_failures must be greater than 0",
                self.source
            )));
        }
        if self.retry_base_ms == 0 || self.retry_max_ms < self.retry_base_ms {
            return Err(ConfigError::ValidationError(format!(
                "{}: retry_base_ms must be positive and not exceed retry_max_ms",
                self.source
            )));
        }
        validate_default_conditions(&self.source, &self.default_conditions)
    }

    /// Every condition type this monitor may emit
    pub fn condition_types(&self) -> Result<Vec<String>, ConfigError> {
        let engine = RuleEngine::from_configs(&self.rules)?;
        let mut types: Vec<String> = engine
            .permanent_condition_types()
            .into_iter()
            .map(str::to_string)
            .collect();
        types.extend(
            self.default_conditions
                .iter()
                .map(|c| c.condition_type.clone()),
        );
        types.push(self.health_condition_type());
        types.sort();
        types.dedup();
        Ok(types)
    }
}

/// One external check command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginConfig {
    /// Identity of the check; runs of the same name never overlap
    pub name: String,
    /// Executable to run
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_plugin_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_plugin_interval_secs")]
    pub interval_secs: f64,
    pub rules: Vec<RuleConfig>,
}

impl PluginConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }
}

/// Configuration of a plugin monitor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginMonitorConfig {
    /// Monitor name, used as the source of emitted statuses
    pub source: String,
    /// Maximum number of plugins running at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Plugin stdout is truncated to this many bytes
    #[serde(default = "default_max_output_length")]
    pub max_output_length: usize,
    /// Time allowed for in-flight runs to finish on shutdown
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: f64,
    /// Consecutive spawn or wait failures of one plugin before detection is reported degraded
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Condition type reporting whether this monitor can run its plugins
    #[serde(default)]
    pub health_condition: Option<String>,
    #[serde(default)]
    pub default_conditions: Vec<DefaultCondition>,
    pub plugins: Vec<PluginConfig>,
}

impl PluginMonitorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs_f64(self.grace_period_secs)
    }

    /// Condition type used to surface plugins that cannot be run
    pub fn health_condition_type(&self) -> String {
        health_condition_type(&self.source, self.health_condition.as_deref())
    }

    /// Check values that deserialization cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_source(&self.source)?;
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: concurrency must be greater than 0",
                self.source
            )));
        }
        if self.max_output_length == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: max_output_length must be greater than 0",
                self.source
            )));
        }
        if !self.grace_period_secs.is_finite() || self.grace_period_secs < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: grace_period_secs must be a non-negative number",
                self.source
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: max_consecutive_failures must be greater than 0",
                self.source
            )));
        }

        let mut names: Vec<&str> = Vec::with_capacity(self.plugins.len());
        for plugin in &self.plugins {
            if plugin.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "{}: plugin name must not be empty",
                    self.source
                )));
            }
            if names.contains(&plugin.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "{}: plugin {:?} is declared more than once",
                    self.source, plugin.name
                )));
            }
            names.push(&plugin.name);

            for (field, value) in [
                ("timeout_secs", plugin.timeout_secs),
                ("interval_secs", plugin.interval_secs),
            ] {
                if !value.is_finite() || value <= 0.0 {
                    return Err(ConfigError::ValidationError(format!(
                        "{}: plugin {:?} {} must be a positive number",
                        self.source, plugin.name, field
                    )));
                }
            }
        }

        validate_default_conditions(&self.source, &self.default_conditions)
    }

    /// Every condition type this monitor may emit
    pub fn condition_types(&self) -> Result<Vec<String>, ConfigError> {
        let mut types: Vec<String> = self
            .default_conditions
            .iter()
            .map(|c| c.condition_type.clone())
            .collect();
        for plugin in &self.plugins {
            let engine = RuleEngine::from_configs(&plugin.rules)?;
            types.extend(
                engine
                    .permanent_condition_types()
                    .into_iter()
                    .map(str::to_string),
            );
        }
        types.push(self.health_condition_type());
        types.sort();
        types.dedup();
        Ok(types)
    }
}

/// Load a monitor configuration file, TOML unless the extension is `.json`
pub fn load_from_path<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(toml::from_str(&content)?)
    }
}

/// Ensure no condition type is emitted by more than one monitor
///
/// `claims` pairs a monitor source with the condition types it may emit.
pub fn validate_exclusive_condition_types(
    claims: &[(String, Vec<String>)],
) -> Result<(), ConfigError> {
    let mut owners: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for (source, types) in claims {
        for condition_type in types {
            if let Some(first) = owners.insert(condition_type.as_str(), source.as_str()) {
                if first != source {
                    return Err(ConfigError::DuplicateConditionType {
                        condition_type: condition_type.clone(),
                        first: first.to_string(),
                        second: source.clone(),
                    });
                }
            }
        }
    }

    let mut sources: Vec<&str> = claims.iter().map(|(s, _)| s.as_str()).collect();
    sources.sort_unstable();
    if let Some(pair) = sources.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(ConfigError::ValidationError(format!(
            "monitor source {:?} is used by more than one configuration",
            pair[0]
        )));
    }
    Ok(())
}

fn health_condition_type(source: &str, configured: Option<&str>) -> String {
    configured
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}MonitorUnavailable", source))
}

fn validate_source(source: &str) -> Result<(), ConfigError> {
    if source.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "monitor source must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_default_conditions(
    source: &str,
    conditions: &[DefaultCondition],
) -> Result<(), ConfigError> {
    for (i, condition) in conditions.iter().enumerate() {
        if condition.condition_type.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{}: default condition #{} has an empty type",
                source, i
            )));
        }
        if conditions[..i]
            .iter()
            .any(|c| c.condition_type == condition.condition_type)
        {
            return Err(ConfigError::ValidationError(format!(
                "{}: default condition {:?} is declared more than once",
                source, condition.condition_type
            )));
        }
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    60_000
}

fn default_plugin_timeout_secs() -> f64 {
    5.0
}

fn default_plugin_interval_secs() -> f64 {
    60.0
}

fn default_concurrency() -> usize {
    3
}

fn default_max_output_length() -> usize {
    80
}

fn default_grace_period_secs() -> f64 {
    5.0
}
