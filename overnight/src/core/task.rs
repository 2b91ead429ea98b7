//! Task model and deterministic category inference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{ModelId, TaskStatus};

/// Category a task is filed under in the outcome history.
///
/// Inferred once from the task text; the learning engine aggregates success
/// rates per category across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    BugFix,
    Performance,
    Feature,
    Refactor,
    Documentation,
    Testing,
    ErrorHandling,
    Setup,
    General,
}

impl TaskCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskCategory::BugFix => "bug_fix",
            TaskCategory::Performance => "performance",
            TaskCategory::Feature => "feature",
            TaskCategory::Refactor => "refactor",
            TaskCategory::Documentation => "documentation",
            TaskCategory::Testing => "testing",
            TaskCategory::ErrorHandling => "error_handling",
            TaskCategory::Setup => "setup",
            TaskCategory::General => "general",
        }
    }
}

/// One unit of natural-language work, executed end-to-end (primary attempt
/// plus validation retries) before the run advances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// 1-indexed position in the task file.
    pub id: u32,
    pub title: String,
    /// Prompt text handed to the agent. Replaced by the refiner in
    /// prompt-loop mode.
    pub prompt: String,
    pub category: TaskCategory,
    pub status: TaskStatus,
    /// Executor invocations so far (primary attempt plus fix retries).
    pub attempts: u32,
    /// Model the router assigned; `None` until dispatch.
    pub model: Option<ModelId>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// `git log --oneline` lines for commits the agent produced.
    pub commits: Vec<String>,
    pub tokens_sent: u64,
    pub tokens_received: u64,
    pub cost: f64,
    /// Human-readable failure note for the report.
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: u32, title: impl Into<String>, prompt: impl Into<String>) -> Self {
        let title = title.into();
        let prompt = prompt.into();
        let category = infer_category(&title, &prompt);
        Self {
            id,
            title,
            prompt,
            category,
            status: TaskStatus::Pending,
            attempts: 0,
            model: None,
            started_at: None,
            ended_at: None,
            commits: Vec::new(),
            tokens_sent: 0,
            tokens_received: 0,
            cost: 0.0,
            error: None,
        }
    }

    pub fn duration_secs(&self) -> u64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0) as u64,
            _ => 0,
        }
    }
}

/// Infer a category from the task text.
///
/// First matching rule wins; rules are ordered from most to least specific so
/// that "fix the failing test" classifies as testing work, not a bug fix.
pub fn infer_category(title: &str, prompt: &str) -> TaskCategory {
    let text = format!("{} {}", title, prompt).to_lowercase();

    const RULES: &[(&[&str], TaskCategory)] = &[
        (&["test", "coverage", "spec"], TaskCategory::Testing),
        (&["document", "docs", "readme", "comment"], TaskCategory::Documentation),
        (&["error handling", "exception", "panic", "unwrap"], TaskCategory::ErrorHandling),
        (&["fix", "bug", "crash", "broken", "regression"], TaskCategory::BugFix),
        (&["performance", "optimi", "speed up", "slow"], TaskCategory::Performance),
        (&["refactor", "clean up", "cleanup", "restructure", "simplify"], TaskCategory::Refactor),
        (&["setup", "set up", "scaffold", "configure", "bootstrap", "install"], TaskCategory::Setup),
        (&["add", "implement", "create", "support", "new "], TaskCategory::Feature),
    ];

    for (keywords, category) in RULES {
        if keywords.iter().any(|kw| text.contains(kw)) {
            return *category;
        }
    }
    TaskCategory::General
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_category_orders_testing_before_bug_fix() {
        assert_eq!(
            infer_category("Fix the failing test", "make the test suite pass"),
            TaskCategory::Testing
        );
        assert_eq!(
            infer_category("Fix login crash", "null pointer on submit"),
            TaskCategory::BugFix
        );
    }

    #[test]
    fn infer_category_defaults_to_general() {
        assert_eq!(infer_category("Misc", "various chores"), TaskCategory::General);
    }

    #[test]
    fn infer_category_is_deterministic() {
        let a = infer_category("Refactor the parser", "split parse() into stages");
        let b = infer_category("Refactor the parser", "split parse() into stages");
        assert_eq!(a, b);
        assert_eq!(a, TaskCategory::Refactor);
    }

    #[test]
    fn new_task_starts_pending_with_zero_counters() {
        let task = Task::new(1, "Add search", "add a search box");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.category, TaskCategory::Feature);
        assert!(task.model.is_none());
        assert_eq!(task.duration_secs(), 0);
    }
}
