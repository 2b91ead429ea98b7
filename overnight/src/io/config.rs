//! Overnight configuration stored under `.overnight/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Session configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to working values; CLI flags overlay
/// the loaded file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Model used when hybrid routing is off, and the local side when it
    /// is on.
    pub model: String,

    /// Remote model used by the hybrid router for early and complex tasks.
    pub remote_model: String,

    /// Number of initial tasks the hybrid router sends to the remote model.
    pub remote_first_k: usize,

    /// Wall-clock budget per agent attempt, in seconds.
    pub task_timeout_secs: u64,

    /// Validation retries after a failed lint/test (beyond the primary
    /// attempt).
    pub fix_retries: u32,

    /// Consecutive task failures before the run aborts and rolls back.
    pub max_failures: u32,

    /// Explicit lint command; when unset the session falls back to the
    /// detected ecosystem default.
    pub lint_cmd: Option<String>,

    /// Explicit test command; same fallback as `lint_cmd`.
    pub test_cmd: Option<String>,

    /// Validation command wall-clock budget, in seconds.
    pub validation_timeout_secs: u64,

    /// Truncate captured agent output beyond this many bytes.
    pub agent_output_limit_bytes: usize,

    /// Memory threshold percent; dispatch pauses above it.
    pub memory_threshold_percent: f64,

    /// How long dispatch waits for memory pressure to clear, in seconds.
    pub memory_max_wait_secs: u64,

    /// Local model used by the prompt refiner.
    pub refine_model: String,

    /// Score (0-10) a refined prompt must reach before it is accepted.
    pub refine_score_threshold: u8,

    /// Refinement iterations before the best draft is taken as-is.
    pub refine_max_iterations: u32,

    /// Let the refiner consult a remote search collaborator. Off by
    /// default; hybrid routing alone never enables remote calls during
    /// refinement.
    pub refine_remote_search: bool,

    /// Timeout for one local LLM call during refinement, in seconds.
    pub refine_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: "ollama/qwen2.5-coder:3b".to_string(),
            remote_model: "gemini".to_string(),
            remote_first_k: 3,
            task_timeout_secs: 30 * 60,
            fix_retries: 2,
            max_failures: 3,
            lint_cmd: None,
            test_cmd: None,
            validation_timeout_secs: 10 * 60,
            agent_output_limit_bytes: 200_000,
            memory_threshold_percent: 75.0,
            memory_max_wait_secs: 120,
            refine_model: "ollama/qwen2.5-coder:3b".to_string(),
            refine_score_threshold: 8,
            refine_max_iterations: 3,
            refine_remote_search: false,
            refine_timeout_secs: 120,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must not be empty"));
        }
        if self.remote_model.trim().is_empty() {
            return Err(anyhow!("remote_model must not be empty"));
        }
        if self.task_timeout_secs == 0 {
            return Err(anyhow!("task_timeout_secs must be > 0"));
        }
        if self.validation_timeout_secs == 0 {
            return Err(anyhow!("validation_timeout_secs must be > 0"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        if self.max_failures == 0 {
            return Err(anyhow!("max_failures must be > 0"));
        }
        if !(0.0..=100.0).contains(&self.memory_threshold_percent) {
            return Err(anyhow!("memory_threshold_percent must be within 0..=100"));
        }
        if self.refine_score_threshold > 10 {
            return Err(anyhow!("refine_score_threshold must be within 0..=10"));
        }
        if self.refine_max_iterations == 0 {
            return Err(anyhow!("refine_max_iterations must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        let cfg = RunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = RunConfig::default();
        cfg.lint_cmd = Some("make lint".to_string());
        cfg.fix_retries = 1;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "fix_retries = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.fix_retries, 5);
        assert_eq!(cfg.max_failures, RunConfig::default().max_failures);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "task_timeout_secs = 0\n").expect("write");
        assert!(load_config(&path).is_err());
    }
}
