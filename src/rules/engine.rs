use crate::error::ConfigError;
use crate::rules::rule::{Classification, Rule, RuleConfig, RuleInput};
use crate::types::Severity;

/// Ordered set of rules; the first match classifies an input
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    /// Create a new rule engine with no rules
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Compile every configured rule, failing on the first invalid one
    pub fn from_configs(configs: &[RuleConfig]) -> Result<Self, ConfigError> {
        let rules = configs
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Classify an input with the first matching rule
    ///
    /// Returns `None` when no rule matches; that is the normal case for
    /// most log lines and healthy plugin runs.
    pub fn evaluate(&self, input: &RuleInput<'_>) -> Option<Classification> {
        self.rules.iter().find_map(|rule| rule.classify(input))
    }

    /// Condition types that permanent rules in this engine may set
    pub fn permanent_condition_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .rules
            .iter()
            .filter(|rule| rule.severity() == Severity::Permanent)
            .filter_map(|rule| rule.condition_type())
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    /// Get the number of configured rules
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
