//! Aggregation of monitor output
//!
//! The [`ProblemDetector`] merges every monitor's status stream, removes
//! repeated condition updates and hands what is left to a [`ProblemSink`].

use crate::types::{Condition, Event};

/// Condition bookkeeping and deduplication
pub mod tracker;

/// Monitor ownership and the aggregation loop
pub mod problem_detector;

pub use problem_detector::{ProblemDetector, ShutdownHandle};
pub use tracker::{ConditionTracker, ConditionUpdate};

/// Receiver of deduplicated detector output
///
/// Calls must not block; implementations queue work for later delivery.
#[cfg_attr(test, mockall::automock)]
pub trait ProblemSink: Send + Sync {
    fn update_condition(&self, condition: Condition);
    fn report_event(&self, event: Event);
}
