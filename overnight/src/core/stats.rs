//! Outcome records and aggregate statistics.
//!
//! `AggregateStats` is always derived by folding the full record history.
//! There are no independently mutable counters anywhere, so the aggregates
//! can never drift from the records they summarize.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::TaskCategory;
use crate::core::types::{FailureReason, ModelId};

/// Attempts needed in a category before `skip_category` may fire.
pub const SKIP_MIN_ATTEMPTS: u64 = 3;
/// Success-rate floor below which a category is advised for skipping.
pub const SKIP_RATE_THRESHOLD: f64 = 0.2;
/// Minimum history size before a model switch is suggested.
pub const SWITCH_MIN_ATTEMPTS: u64 = 5;
/// Overall success-rate floor below which a model switch is suggested.
pub const SWITCH_RATE_THRESHOLD: f64 = 0.5;

/// One appended (never mutated, never deleted) task outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub category: TaskCategory,
    pub success: bool,
    pub duration_secs: u64,
    pub commits: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub model: ModelId,
    pub timestamp: DateTime<Utc>,
}

/// Attempt/success counts for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub attempts: u64,
    pub successes: u64,
}

impl Tally {
    /// Success rate in `[0, 1]`; zero attempts yield 0.0 rather than NaN.
    pub fn rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// Aggregates derived from a fold over the full outcome history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub overall: Tally,
    /// Per-category tallies, keyed by category name for stable serialization.
    pub by_category: BTreeMap<String, Tally>,
    pub total_commits: u64,
    pub total_duration_secs: u64,
}

impl AggregateStats {
    /// Fold the entire history into aggregates.
    pub fn fold(records: &[OutcomeRecord]) -> Self {
        let mut stats = AggregateStats::default();
        for record in records {
            stats.overall.attempts += 1;
            let tally = stats
                .by_category
                .entry(record.category.as_str().to_string())
                .or_default();
            tally.attempts += 1;
            if record.success {
                stats.overall.successes += 1;
                tally.successes += 1;
            }
            stats.total_commits += u64::from(record.commits);
            stats.total_duration_secs += record.duration_secs;
        }
        stats
    }

    pub fn category(&self, category: TaskCategory) -> Tally {
        self.by_category
            .get(category.as_str())
            .copied()
            .unwrap_or_default()
    }

    /// Advisory: the category has enough history and a poor track record.
    ///
    /// The orchestrator logs this and surfaces it in the report; it never
    /// skips a task on its own.
    pub fn skip_category(&self, category: TaskCategory) -> bool {
        let tally = self.category(category);
        tally.attempts >= SKIP_MIN_ATTEMPTS && tally.rate() < SKIP_RATE_THRESHOLD
    }

    /// Advisory: overall success is poor enough that a more capable model is
    /// worth considering.
    pub fn suggest_model_switch(&self) -> bool {
        self.overall.attempts >= SWITCH_MIN_ATTEMPTS
            && self.overall.rate() < SWITCH_RATE_THRESHOLD
    }
}
