//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between components. They carry no I/O
//! and serialize to stable JSON, since most of them end up in the persisted
//! run state or the outcome history.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a model backend, e.g. `ollama/qwen2.5-coder:3b` or `gemini`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle status of a single task.
///
/// `Dispatched` is transient (observable only if the process dies mid-task);
/// everything else is terminal for the task within one run. `Interrupted` is
/// deliberately distinct from the failure statuses so that `--resume` restarts
/// exactly the interrupted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    TimedOut,
    Crashed,
    FailedWithWarnings,
    Interrupted,
}

impl TaskStatus {
    /// Terminal statuses that count against `consecutive_failures`.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TaskStatus::Failed
                | TaskStatus::TimedOut
                | TaskStatus::Crashed
                | TaskStatus::FailedWithWarnings
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Dispatched)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::Crashed => "crashed",
            TaskStatus::FailedWithWarnings => "failed_with_warnings",
            TaskStatus::Interrupted => "interrupted",
        }
    }
}

/// Terminal classification of one executor invocation.
///
/// The executor itself never retries any of these; retry policy lives in the
/// validation loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExecOutcome {
    /// Agent exited zero.
    Completed,
    /// Agent exited nonzero.
    Failed { exit_code: i32 },
    /// Wall-clock timeout; the whole process group was killed.
    TimedOut,
    /// Killed by a signal, or died without an exit status, or failed to spawn.
    Crashed,
    /// User interrupt arrived while the agent was running.
    Interrupted,
}

impl ExecOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ExecOutcome::Completed)
    }
}

/// Outcome of one lint or test command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Command line that was run, for the report and fix prompts.
    pub command: String,
    /// Exit code, if the command produced one.
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, truncated to the configured byte limit.
    pub output: String,
    pub passed: bool,
}

/// Why a task ended in a non-success terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ExecFailed,
    Timeout,
    Crash,
    LintFailed,
    TestFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ExecFailed => "exec_failed",
            FailureReason::Timeout => "timeout",
            FailureReason::Crash => "crash",
            FailureReason::LintFailed => "lint_failed",
            FailureReason::TestFailed => "test_failed",
        }
    }
}
