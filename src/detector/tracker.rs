use crate::types::{Condition, Timestamp};
use log::error;
use std::collections::{BTreeMap, HashMap};

/// What a condition update changed
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionUpdate {
    /// Status differs from the last known value
    Changed(Condition),
    /// Same status with a new reason or message
    Refreshed(Condition),
}

impl ConditionUpdate {
    pub fn condition(&self) -> &Condition {
        match self {
            ConditionUpdate::Changed(c) | ConditionUpdate::Refreshed(c) => c,
        }
    }

    pub fn into_condition(self) -> Condition {
        match self {
            ConditionUpdate::Changed(c) | ConditionUpdate::Refreshed(c) => c,
        }
    }
}

/// Last known value and owning source of every condition type
#[derive(Debug, Default, Clone)]
pub struct ConditionTracker {
    last_known: BTreeMap<String, Condition>,
    owners: HashMap<String, String>,
}

impl ConditionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an update from `source`, returning what should be forwarded
    ///
    /// The first source to report a type owns it. Updates for that type from
    /// any other source are logged and discarded.
    pub fn apply(
        &mut self,
        source: &str,
        mut condition: Condition,
        now: Timestamp,
    ) -> Option<ConditionUpdate> {
        let owner = self
            .owners
            .entry(condition.condition_type.clone())
            .or_insert_with(|| source.to_string());
        if owner.as_str() != source {
            error!(
                "Condition {} owned by {} was reported by {}, ignoring",
                condition.condition_type, owner, source
            );
            return None;
        }

        match self.last_known.get(&condition.condition_type) {
            Some(known) if known.status == condition.status => {
                if known.same_detail(&condition) {
                    return None;
                }
                condition.transition_time = known.transition_time;
                self.last_known
                    .insert(condition.condition_type.clone(), condition.clone());
                Some(ConditionUpdate::Refreshed(condition))
            }
            _ => {
                condition.transition_time = now;
                self.last_known
                    .insert(condition.condition_type.clone(), condition.clone());
                Some(ConditionUpdate::Changed(condition))
            }
        }
    }

    #[cfg(test)]
    pub fn get(&self, condition_type: &str) -> Option<&Condition> {
        self.last_known.get(condition_type)
    }

    /// Known conditions ordered by type
    pub fn conditions(&self) -> Vec<Condition> {
        self.last_known.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.last_known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_known.is_empty()
    }
}
