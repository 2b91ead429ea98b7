//! Run state: the single value threaded through the whole session.
//!
//! There is no mutable orchestrator singleton; every transition happens on
//! this value and is persisted by the caller. The transitions here are pure
//! so the whole-run state machine is testable without a repository.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::Task;
use crate::core::types::TaskStatus;

/// Named repository snapshot tied to a successfully completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Git tag name, `overnight/<run_id>/ckpt-<index>`.
    pub tag: String,
    /// 0-based index of the task this checkpoint belongs to.
    pub task_index: usize,
    /// Commit the tag points at.
    pub commit: String,
    pub created_at: DateTime<Utc>,
}

/// Where a rollback lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    /// Most recent checkpoint of a Succeeded task.
    Checkpoint(Checkpoint),
    /// No checkpoint exists yet; restore the branch's initial commit.
    BaseCommit(String),
}

/// Persisted whole-run state (`.overnight/run_state.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub project_path: String,
    pub tasks_file: String,
    pub branch: String,
    /// Commit the run branch started from; rollback target of last resort.
    pub base_commit: String,
    pub started_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    /// Index of the next task to dispatch. Only increases, except on
    /// rollback, which resets it to the last checkpoint's task index.
    pub current_index: usize,
    /// Failure outcomes since the last success; resets on any success.
    pub consecutive_failures: u32,
    pub checkpoints: Vec<Checkpoint>,
    pub hybrid: bool,
    pub prompt_loop: bool,
    pub dry_run: bool,
    /// Cleared when the run finishes and the state file is archived; a state
    /// file with `resumable: false` must not be resumed.
    pub resumable: bool,
    /// Human-readable warnings accumulated for the report.
    pub warnings: Vec<String>,
}

impl RunState {
    pub fn new(
        run_id: impl Into<String>,
        project_path: impl AsRef<Path>,
        tasks_file: impl Into<String>,
        branch: impl Into<String>,
        base_commit: impl Into<String>,
        tasks: Vec<Task>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            project_path: project_path.as_ref().display().to_string(),
            tasks_file: tasks_file.into(),
            branch: branch.into(),
            base_commit: base_commit.into(),
            started_at: Utc::now(),
            tasks,
            current_index: 0,
            consecutive_failures: 0,
            checkpoints: Vec::new(),
            hybrid: false,
            prompt_loop: false,
            dry_run: false,
            resumable: true,
            warnings: Vec::new(),
        }
    }

    /// Index of the next task that still needs work, skipping Succeeded
    /// tasks. Returns `None` when the run is complete.
    ///
    /// Resuming lands here: a task persisted as Succeeded is never
    /// re-executed, and an Interrupted or Dispatched task is retried.
    pub fn next_pending(&self) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .skip(self.current_index)
            .find(|(_, task)| task.status != TaskStatus::Succeeded)
            .map(|(index, _)| index)
    }

    /// Record a terminal outcome for the task at `index` and update the
    /// consecutive-failure counter.
    pub fn record_outcome(&mut self, index: usize, status: TaskStatus) {
        debug_assert!(status.is_terminal());
        self.tasks[index].status = status;
        if status == TaskStatus::Succeeded {
            self.consecutive_failures = 0;
        } else if status.is_failure() {
            self.consecutive_failures += 1;
        }
    }

    /// Advance past the task at `index` after its terminal outcome.
    pub fn advance(&mut self, index: usize) {
        debug_assert!(index >= self.current_index);
        self.current_index = index + 1;
    }

    pub fn add_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.push(checkpoint);
    }

    /// Most recent checkpoint of a Succeeded task, falling back to the
    /// branch's initial commit. Never targets a failed or partial task.
    pub fn rollback_target(&self) -> RollbackTarget {
        self.checkpoints
            .iter()
            .rev()
            .find(|ckpt| {
                self.tasks
                    .get(ckpt.task_index)
                    .is_some_and(|task| task.status == TaskStatus::Succeeded)
            })
            .cloned()
            .map(RollbackTarget::Checkpoint)
            .unwrap_or_else(|| RollbackTarget::BaseCommit(self.base_commit.clone()))
    }

    /// Reset the cursor after a rollback. The only transition that moves
    /// `current_index` backwards.
    pub fn apply_rollback(&mut self, target: &RollbackTarget) {
        if let RollbackTarget::Checkpoint(ckpt) = target {
            self.current_index = ckpt.task_index;
        } else {
            self.current_index = 0;
        }
    }

    pub fn succeeded_count(&self) -> usize {
        self.count_status(TaskStatus::Succeeded)
    }

    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Succeeded)
    }

    pub fn total_commits(&self) -> usize {
        self.tasks.iter().map(|t| t.commits.len()).sum()
    }

    pub fn total_cost(&self) -> f64 {
        self.tasks.iter().map(|t| t.cost).sum()
    }

    /// Total `(sent, received)` token counts across all tasks.
    pub fn total_tokens(&self) -> (u64, u64) {
        self.tasks.iter().fold((0, 0), |(sent, received), t| {
            (sent + t.tokens_sent, received + t.tokens_received)
        })
    }
}

/// Check structural invariants of a loaded state.
///
/// Returns all violations rather than the first, so a corrupt resume file
/// produces a complete diagnosis.
pub fn validate_state(state: &RunState) -> Vec<String> {
    let mut errors = Vec::new();

    if state.current_index > state.tasks.len() {
        errors.push(format!(
            "current_index {} exceeds task count {}",
            state.current_index,
            state.tasks.len()
        ));
    }

    for ckpt in &state.checkpoints {
        match state.tasks.get(ckpt.task_index) {
            None => errors.push(format!(
                "checkpoint '{}' references missing task index {}",
                ckpt.tag, ckpt.task_index
            )),
            Some(task) if task.status != TaskStatus::Succeeded => errors.push(format!(
                "checkpoint '{}' references task {} with status {}",
                ckpt.tag,
                ckpt.task_index,
                task.status.as_str()
            )),
            Some(_) => {}
        }
    }

    let mut seen = std::collections::HashSet::new();
    for ckpt in &state.checkpoints {
        if !seen.insert(ckpt.task_index) {
            errors.push(format!("duplicate checkpoint for task index {}", ckpt.task_index));
        }
    }

    for task in &state.tasks {
        if task.status == TaskStatus::Succeeded
            && !state.checkpoints.iter().any(|c| {
                state.tasks.get(c.task_index).map(|t| t.id) == Some(task.id)
            })
            && !state.dry_run
        {
            errors.push(format!("succeeded task {} has no checkpoint", task.id));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Task;

    fn state_with_tasks(n: u32) -> RunState {
        RunState {
            run_id: "run-test".to_string(),
            project_path: "/tmp/project".to_string(),
            tasks_file: "tasks.md".to_string(),
            branch: "overnight-test".to_string(),
            base_commit: "abc123".to_string(),
            started_at: Utc::now(),
            tasks: (1..=n)
                .map(|i| Task::new(i, format!("task {i}"), format!("do thing {i}")))
                .collect(),
            current_index: 0,
            consecutive_failures: 0,
            checkpoints: Vec::new(),
            hybrid: false,
            prompt_loop: false,
            dry_run: false,
            resumable: true,
            warnings: Vec::new(),
        }
    }

    fn checkpoint(index: usize) -> Checkpoint {
        Checkpoint {
            tag: format!("overnight/run-test/ckpt-{index}"),
            task_index: index,
            commit: format!("commit-{index}"),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn total_tokens_splits_sent_and_received() {
        let mut state = state_with_tasks(2);
        state.tasks[0].tokens_sent = 1000;
        state.tasks[0].tokens_received = 200;
        state.tasks[1].tokens_sent = 50;
        state.tasks[1].tokens_received = 10;
        assert_eq!(state.total_tokens(), (1050, 210));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut state = state_with_tasks(3);
        state.record_outcome(0, TaskStatus::TimedOut);
        state.record_outcome(1, TaskStatus::FailedWithWarnings);
        assert_eq!(state.consecutive_failures, 2);

        state.record_outcome(2, TaskStatus::Succeeded);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn interrupted_does_not_count_as_failure() {
        let mut state = state_with_tasks(1);
        state.record_outcome(0, TaskStatus::Interrupted);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn next_pending_skips_succeeded_tasks() {
        let mut state = state_with_tasks(3);
        state.record_outcome(0, TaskStatus::Succeeded);
        state.add_checkpoint(checkpoint(0));
        state.advance(0);
        assert_eq!(state.next_pending(), Some(1));

        // A resumed state with an interrupted task restarts exactly there.
        state.record_outcome(1, TaskStatus::Interrupted);
        assert_eq!(state.next_pending(), Some(1));
    }

    #[test]
    fn rollback_targets_last_succeeded_checkpoint() {
        let mut state = state_with_tasks(3);
        state.record_outcome(0, TaskStatus::Succeeded);
        state.add_checkpoint(checkpoint(0));
        state.advance(0);
        state.record_outcome(1, TaskStatus::Succeeded);
        state.add_checkpoint(checkpoint(1));
        state.advance(1);
        state.record_outcome(2, TaskStatus::Failed);

        match state.rollback_target() {
            RollbackTarget::Checkpoint(ckpt) => assert_eq!(ckpt.task_index, 1),
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn rollback_without_checkpoints_targets_base_commit() {
        let mut state = state_with_tasks(2);
        state.record_outcome(0, TaskStatus::Failed);
        state.advance(0);
        state.record_outcome(1, TaskStatus::Failed);

        assert_eq!(
            state.rollback_target(),
            RollbackTarget::BaseCommit("abc123".to_string())
        );
        let target = state.rollback_target();
        state.apply_rollback(&target);
        assert_eq!(state.current_index, 0);
    }

    #[test]
    fn rollback_resets_cursor_to_checkpoint_index() {
        let mut state = state_with_tasks(3);
        state.record_outcome(0, TaskStatus::Succeeded);
        state.add_checkpoint(checkpoint(0));
        state.advance(0);
        state.record_outcome(1, TaskStatus::Failed);
        state.advance(1);

        let target = state.rollback_target();
        state.apply_rollback(&target);
        assert_eq!(state.current_index, 0);
    }

    #[test]
    fn validate_state_flags_checkpoint_for_failed_task() {
        let mut state = state_with_tasks(2);
        state.record_outcome(0, TaskStatus::Failed);
        state.add_checkpoint(checkpoint(0));

        let errors = validate_state(&state);
        assert!(errors.iter().any(|e| e.contains("status failed")), "{errors:?}");
    }

    #[test]
    fn validate_state_flags_succeeded_task_without_checkpoint() {
        let mut state = state_with_tasks(1);
        state.record_outcome(0, TaskStatus::Succeeded);
        let errors = validate_state(&state);
        assert!(errors.iter().any(|e| e.contains("no checkpoint")), "{errors:?}");
    }

    #[test]
    fn validate_state_flags_out_of_range_cursor() {
        let mut state = state_with_tasks(1);
        state.current_index = 5;
        let errors = validate_state(&state);
        assert!(errors.iter().any(|e| e.contains("exceeds task count")), "{errors:?}");
    }

    #[test]
    fn clean_state_validates() {
        let mut state = state_with_tasks(2);
        state.record_outcome(0, TaskStatus::Succeeded);
        state.add_checkpoint(checkpoint(0));
        state.advance(0);
        assert!(validate_state(&state).is_empty());
    }
}
