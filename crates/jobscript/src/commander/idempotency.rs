//! Idempotency tracking for duplicate submissions
//!
//! Keys map to the last observed execution error. Entries live for the
//! process lifetime; there is no TTL or pruning, so unbounded keyspaces are
//! the caller's to manage (swap in a pruning tracker if that matters).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::JobError;
use crate::model::DedupPolicy;

/// What the pre-execution check decided.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupDecision {
    /// Run the job; an entry was created or reset as needed.
    Proceed,
    /// Reject the duplicate, surfacing the stored prior error.
    Drop(Option<JobError>),
    /// Coalesce onto the first submission's outcome without re-executing.
    Merge(Option<JobError>),
}

#[derive(Default)]
struct DedupEntry {
    last_err: Option<JobError>,
}

/// Tracks idempotency keys to enforce deduplication policies.
#[derive(Default)]
pub struct IdempotencyTracker {
    entries: Mutex<HashMap<String, DedupEntry>>,
}

impl IdempotencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consult the tracker before executing. Empty keys and the `ignore`
    /// policy always proceed without writing an entry.
    pub fn before_execute(&self, key: &str, policy: DedupPolicy) -> DedupDecision {
        if key.is_empty() || policy == DedupPolicy::Ignore {
            return DedupDecision::Proceed;
        }

        let mut entries = self.entries.lock().expect("idempotency poisoned");

        match entries.get(key) {
            None => {
                entries.insert(key.to_string(), DedupEntry::default());
                DedupDecision::Proceed
            }
            Some(entry) => match policy {
                DedupPolicy::Drop => DedupDecision::Drop(entry.last_err.clone()),
                DedupPolicy::Merge => DedupDecision::Merge(entry.last_err.clone()),
                DedupPolicy::Replace => {
                    entries.insert(key.to_string(), DedupEntry::default());
                    DedupDecision::Proceed
                }
                DedupPolicy::Ignore => DedupDecision::Proceed,
            },
        }
    }

    /// Record the execution outcome for the key. Called after every
    /// proceed, success or failure.
    pub fn after_execute(&self, key: &str, policy: DedupPolicy, exec_err: Option<&JobError>) {
        if key.is_empty() || policy == DedupPolicy::Ignore {
            return;
        }

        let mut entries = self.entries.lock().expect("idempotency poisoned");
        let entry = entries.entry(key.to_string()).or_default();
        entry.last_err = exec_err.cloned();
    }

    /// Number of live entries; useful for observability.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("idempotency poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::codes;

    #[test]
    fn empty_key_or_ignore_policy_always_proceeds() {
        let tracker = IdempotencyTracker::new();

        assert_eq!(
            tracker.before_execute("", DedupPolicy::Drop),
            DedupDecision::Proceed
        );
        assert_eq!(
            tracker.before_execute("k", DedupPolicy::Ignore),
            DedupDecision::Proceed
        );
        // Neither wrote an entry.
        assert!(tracker.is_empty());
    }

    #[test]
    fn first_submission_proceeds_and_registers() {
        let tracker = IdempotencyTracker::new();
        assert_eq!(
            tracker.before_execute("k", DedupPolicy::Drop),
            DedupDecision::Proceed
        );
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn duplicate_with_drop_is_dropped_with_prior_error() {
        let tracker = IdempotencyTracker::new();
        tracker.before_execute("k", DedupPolicy::Drop);
        tracker.after_execute(
            "k",
            DedupPolicy::Drop,
            Some(&JobError::external(codes::SHELL_EXECUTION_ERROR, "boom")),
        );

        match tracker.before_execute("k", DedupPolicy::Drop) {
            DedupDecision::Drop(Some(prior)) => {
                assert_eq!(prior.code, codes::SHELL_EXECUTION_ERROR)
            }
            other => panic!("expected drop with prior error, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_with_merge_surfaces_prior_outcome() {
        let tracker = IdempotencyTracker::new();
        tracker.before_execute("k", DedupPolicy::Merge);
        tracker.after_execute("k", DedupPolicy::Merge, None);

        assert_eq!(
            tracker.before_execute("k", DedupPolicy::Merge),
            DedupDecision::Merge(None)
        );
    }

    #[test]
    fn replace_resets_the_entry_and_proceeds() {
        let tracker = IdempotencyTracker::new();
        tracker.before_execute("k", DedupPolicy::Replace);
        tracker.after_execute(
            "k",
            DedupPolicy::Replace,
            Some(&JobError::external(codes::SHELL_EXECUTION_ERROR, "boom")),
        );

        assert_eq!(
            tracker.before_execute("k", DedupPolicy::Replace),
            DedupDecision::Proceed
        );
        // Entry was reset; a later merge sees no prior error.
        assert_eq!(
            tracker.before_execute("k", DedupPolicy::Merge),
            DedupDecision::Merge(None)
        );
    }
}
