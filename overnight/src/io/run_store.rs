//! Durable run-state storage under `.overnight/`.
//!
//! The state file is the only resume point; it is written atomically after
//! every task transition so a kill at any moment leaves a loadable file.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::state::{RunState, validate_state};

pub const STATE_DIR: &str = ".overnight";
pub const STATE_FILE: &str = "run_state.json";

/// The persisted state is unreadable or violates its own invariants.
/// Fatal on resume; the run must stop rather than silently partially resume.
#[derive(Debug)]
pub struct StateCorruption {
    pub path: PathBuf,
    pub problems: Vec<String>,
}

impl fmt::Display for StateCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "corrupt run state {}: {}",
            self.path.display(),
            self.problems.join("; ")
        )
    }
}

impl std::error::Error for StateCorruption {}

/// Paths for one project's durable overnight files.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            root: project_path.into().join(STATE_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join("history.jsonl")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn has_state(&self) -> bool {
        self.state_path().is_file()
    }

    /// Atomically write the run state (temp file + rename).
    #[instrument(skip_all, fields(run_id = %state.run_id))]
    pub fn save(&self, state: &RunState) -> Result<()> {
        debug!(current_index = state.current_index, "writing run state");
        let mut buf = serde_json::to_string_pretty(state)?;
        buf.push('\n');
        write_atomic(&self.state_path(), &buf)
    }

    /// Load and validate the persisted state for resume.
    ///
    /// Parse failures and invariant violations both surface as
    /// [`StateCorruption`]; callers downcast to distinguish the fatal class.
    #[instrument(skip_all)]
    pub fn load(&self) -> Result<RunState> {
        let path = self.state_path();
        debug!(path = %path.display(), "loading run state");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read run state {}", path.display()))?;
        let state: RunState = serde_json::from_str(&contents).map_err(|e| {
            anyhow::Error::new(StateCorruption {
                path: path.clone(),
                problems: vec![format!("unparseable JSON: {e}")],
            })
        })?;

        if !state.resumable {
            return Err(anyhow::Error::new(StateCorruption {
                path,
                problems: vec!["state file is from a finished run".to_string()],
            }));
        }
        let problems = validate_state(&state);
        if !problems.is_empty() {
            warn!(problem_count = problems.len(), "run state failed validation");
            return Err(anyhow::Error::new(StateCorruption { path, problems }));
        }
        debug!(run_id = %state.run_id, current_index = state.current_index, "run state loaded");
        Ok(state)
    }

    /// Move the finished run's state to `.overnight/archive/<run_id>.json`
    /// so the next run starts fresh.
    #[instrument(skip_all, fields(run_id = %state.run_id))]
    pub fn archive(&self, state: &mut RunState) -> Result<()> {
        state.resumable = false;
        self.save(state)?;
        let archive_dir = self.archive_dir();
        fs::create_dir_all(&archive_dir)
            .with_context(|| format!("create archive dir {}", archive_dir.display()))?;
        let dest = archive_dir.join(format!("{}.json", state.run_id));
        fs::rename(self.state_path(), &dest)
            .with_context(|| format!("archive run state to {}", dest.display()))?;
        info!(dest = %dest.display(), "run state archived");
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Checkpoint;
    use crate::core::task::Task;
    use crate::core::types::TaskStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample_state() -> RunState {
        RunState::new(
            "run-20260829-0100",
            "/tmp/project",
            "TASKS.md",
            "overnight-20260829",
            "abc123",
            vec![Task::new(1, "one", "do one"), Task::new(2, "two", "do two")],
        )
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let store = RunStore::new(dir.path());
        let mut state = sample_state();
        state.record_outcome(0, TaskStatus::Succeeded);
        state.add_checkpoint(Checkpoint {
            tag: "overnight/run-20260829-0100/ckpt-0".to_string(),
            task_index: 0,
            commit: "def456".to_string(),
            created_at: Utc::now(),
        });
        state.advance(0);

        store.save(&state).expect("save");
        let loaded = store.load().expect("load");
        assert_eq!(loaded.current_index, 1);
        assert_eq!(loaded.tasks[0].status, TaskStatus::Succeeded);
    }

    #[test]
    fn load_rejects_unparseable_file_as_corruption() {
        let dir = TempDir::new().expect("tempdir");
        let store = RunStore::new(dir.path());
        fs::create_dir_all(store.root()).expect("mkdir");
        fs::write(store.state_path(), "{ not json").expect("write");

        let err = store.load().expect_err("must fail");
        assert!(err.downcast_ref::<StateCorruption>().is_some());
    }

    #[test]
    fn load_rejects_invariant_violations_as_corruption() {
        let dir = TempDir::new().expect("tempdir");
        let store = RunStore::new(dir.path());
        let mut state = sample_state();
        state.current_index = 99;
        store.save(&state).expect("save");

        let err = store.load().expect_err("must fail");
        let corruption = err.downcast_ref::<StateCorruption>().expect("typed error");
        assert!(corruption.problems.iter().any(|p| p.contains("exceeds task count")));
    }

    #[test]
    fn archive_moves_state_and_clears_resumable() {
        let dir = TempDir::new().expect("tempdir");
        let store = RunStore::new(dir.path());
        let mut state = sample_state();
        store.save(&state).expect("save");

        store.archive(&mut state).expect("archive");
        assert!(!store.has_state());
        let archived = dir
            .path()
            .join(".overnight/archive/run-20260829-0100.json");
        assert!(archived.is_file());

        // An archived file must not be resumable even if copied back.
        fs::rename(&archived, store.state_path()).expect("restore");
        let err = store.load().expect_err("must fail");
        assert!(err.downcast_ref::<StateCorruption>().is_some());
    }
}
