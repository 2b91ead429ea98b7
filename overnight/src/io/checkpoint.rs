//! Checkpoint creation and rollback against the git worktree.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::state::{Checkpoint, RollbackTarget, RunState};
use crate::io::git::Git;

/// Creates checkpoints after successful tasks and rolls the worktree back
/// to the last known-good commit when the session aborts.
#[derive(Debug)]
pub struct CheckpointManager<'a> {
    git: &'a Git,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(git: &'a Git) -> Self {
        Self { git }
    }

    /// Tag the current HEAD as the checkpoint for a just-succeeded task and
    /// record it in the run state.
    #[instrument(skip_all, fields(task_index))]
    pub fn create(&self, state: &mut RunState, task_index: usize) -> Result<()> {
        let commit = self.git.head_sha().context("resolve HEAD for checkpoint")?;
        let tag = format!("overnight/{}/ckpt-{}", state.run_id, task_index);
        self.git
            .tag_at(&tag, &commit)
            .with_context(|| format!("tag checkpoint {tag}"))?;
        info!(tag = %tag, commit = %commit, "checkpoint created");
        state.add_checkpoint(Checkpoint {
            tag,
            task_index,
            commit,
            created_at: Utc::now(),
        });
        Ok(())
    }

    /// Roll the worktree back to the last good checkpoint, or to the base
    /// commit if no task has succeeded yet.
    ///
    /// The target is a fixed commit id; if HEAD is already there (a repeat
    /// after a crash mid-rollback) nothing is reset.
    #[instrument(skip_all)]
    pub fn rollback(&self, state: &mut RunState) -> Result<RollbackTarget> {
        let target = state.rollback_target();
        let commit = match &target {
            RollbackTarget::Checkpoint(ckpt) => {
                warn!(tag = %ckpt.tag, commit = %ckpt.commit, "rolling back to checkpoint");
                ckpt.commit.clone()
            }
            RollbackTarget::BaseCommit(commit) => {
                warn!(commit = %commit, "no checkpoint, rolling back to base commit");
                commit.clone()
            }
        };
        let head = self.git.head_sha().context("resolve HEAD before rollback")?;
        if head == commit {
            debug!(commit = %commit, "already at rollback target");
        } else {
            self.git
                .reset_hard(&commit)
                .with_context(|| format!("reset to {commit}"))?;
        }
        state.apply_rollback(&target);
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Task;
    use crate::core::types::TaskStatus;
    use crate::test_support::TestRepo;

    fn state_for(repo: &TestRepo, git: &Git, titles: &[&str]) -> RunState {
        let base = git.head_sha().expect("head");
        let tasks = titles
            .iter()
            .enumerate()
            .map(|(i, t)| Task::new(i as u32 + 1, *t, "do it"))
            .collect();
        RunState::new(
            "run-test",
            repo.path(),
            "TASKS.md",
            "overnight/run-test",
            &base,
            tasks,
        )
    }

    #[test]
    fn create_tags_head_and_records_checkpoint() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let mut state = state_for(&repo, &git, &["one"]);
        repo.commit_file("a.txt", "a", "task 1 work").expect("commit");

        let manager = CheckpointManager::new(&git);
        manager.create(&mut state, 0).expect("checkpoint");

        assert_eq!(state.checkpoints.len(), 1);
        assert_eq!(state.checkpoints[0].tag, "overnight/run-test/ckpt-0");
        assert_eq!(state.checkpoints[0].commit, git.head_sha().expect("head"));
    }

    #[test]
    fn rollback_without_checkpoint_resets_to_base() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let mut state = state_for(&repo, &git, &["one"]);
        let base = state.base_commit.clone();
        repo.commit_file("a.txt", "a", "stray work").expect("commit");

        let manager = CheckpointManager::new(&git);
        let target = manager.rollback(&mut state).expect("rollback");

        assert!(matches!(target, RollbackTarget::BaseCommit(c) if c == base));
        assert_eq!(git.head_sha().expect("head"), base);
        assert_eq!(state.current_index, 0);
    }

    #[test]
    fn rollback_is_idempotent() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let mut state = state_for(&repo, &git, &["one", "two"]);

        repo.commit_file("a.txt", "a", "task 1 work").expect("commit");
        let manager = CheckpointManager::new(&git);
        state.tasks[0].status = TaskStatus::Succeeded;
        manager.create(&mut state, 0).expect("checkpoint");
        let good = git.head_sha().expect("head");

        repo.commit_file("b.txt", "b", "task 2 partial").expect("commit");
        manager.rollback(&mut state).expect("rollback");
        assert_eq!(git.head_sha().expect("head"), good);

        manager.rollback(&mut state).expect("rollback again");
        assert_eq!(git.head_sha().expect("head"), good);
    }
}
