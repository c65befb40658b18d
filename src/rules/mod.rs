/// Ordered rule evaluation
pub mod engine;
pub mod rule;

pub use engine::RuleEngine;
pub use rule::{Classification, ExitStatus, Rule, RuleConfig, RuleInput};
