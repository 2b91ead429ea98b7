//! Validation commands: lint and test runs after each agent attempt.
//!
//! Commands come from config when set, otherwise from a one-time ecosystem
//! detection at session start. Detection is a ranked marker list; the first
//! match wins and the result never changes mid-run.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::types::ValidationResult;
use crate::io::process::run_command_with_timeout;

/// Max validation output retained per command (feeds the fix prompt).
const OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Project ecosystem, decided once from repository markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ecosystem {
    Rust,
    Node,
    Python,
    Go,
}

impl Ecosystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Ecosystem::Rust => "rust",
            Ecosystem::Node => "node",
            Ecosystem::Python => "python",
            Ecosystem::Go => "go",
        }
    }

    pub fn default_lint_cmd(self) -> &'static str {
        match self {
            Ecosystem::Rust => "cargo clippy --all-targets -- -D warnings",
            Ecosystem::Node => "npm run lint --if-present",
            Ecosystem::Python => "ruff check .",
            Ecosystem::Go => "go vet ./...",
        }
    }

    pub fn default_test_cmd(self) -> &'static str {
        match self {
            Ecosystem::Rust => "cargo test",
            Ecosystem::Node => "npm test",
            Ecosystem::Python => "pytest -q",
            Ecosystem::Go => "go test ./...",
        }
    }
}

/// Ranked marker files; first existing marker decides.
const MARKERS: &[(&str, Ecosystem)] = &[
    ("Cargo.toml", Ecosystem::Rust),
    ("package.json", Ecosystem::Node),
    ("pyproject.toml", Ecosystem::Python),
    ("setup.py", Ecosystem::Python),
    ("go.mod", Ecosystem::Go),
];

/// Detect the project ecosystem from marker files at the repository root.
#[instrument(skip_all)]
pub fn detect_ecosystem(root: &Path) -> Option<Ecosystem> {
    for (marker, ecosystem) in MARKERS {
        if root.join(marker).is_file() {
            info!(marker, ecosystem = ecosystem.as_str(), "detected project ecosystem");
            return Some(*ecosystem);
        }
    }
    debug!("no ecosystem marker found");
    None
}

/// The lint/test command pair a session runs after each attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationCommands {
    pub lint: Option<String>,
    pub test: Option<String>,
}

impl ValidationCommands {
    /// Explicit config wins; unset slots fall back to ecosystem defaults.
    pub fn resolve(
        lint_cmd: Option<String>,
        test_cmd: Option<String>,
        ecosystem: Option<Ecosystem>,
    ) -> Self {
        Self {
            lint: lint_cmd.or_else(|| ecosystem.map(|e| e.default_lint_cmd().to_string())),
            test: test_cmd.or_else(|| ecosystem.map(|e| e.default_test_cmd().to_string())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lint.is_none() && self.test.is_none()
    }

    /// Commands in run order, lint before test.
    pub fn ordered(&self) -> Vec<&str> {
        self.lint
            .iter()
            .chain(self.test.iter())
            .map(String::as_str)
            .collect()
    }
}

/// Runs a single validation command. Seam for tests.
pub trait ValidationRunner {
    fn run(&self, command: &str) -> Result<ValidationResult>;
}

/// Shells out through `sh -c` in the project workdir.
#[derive(Debug)]
pub struct CommandValidator {
    workdir: std::path::PathBuf,
    timeout: Duration,
}

impl CommandValidator {
    pub fn new(workdir: impl Into<std::path::PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }
}

impl ValidationRunner for CommandValidator {
    #[instrument(skip_all, fields(command))]
    fn run(&self, command: &str) -> Result<ValidationResult> {
        debug!(command, "running validation command");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&self.workdir);
        let out = run_command_with_timeout(cmd, None, self.timeout, OUTPUT_LIMIT_BYTES, None)
            .with_context(|| format!("run validation command '{command}'"))?;

        let mut output = out.stdout_lossy();
        let stderr = out.stderr_lossy();
        if !stderr.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&stderr);
        }
        output.push_str(&out.truncated_notice("validation"));

        let passed = out.status.success() && !out.timed_out;
        info!(command, passed, exit_code = ?out.exit_code(), "validation command finished");
        Ok(ValidationResult {
            command: command.to_string(),
            exit_code: out.exit_code(),
            output,
            passed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_marker_wins() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("package.json"), "{}").expect("write");
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").expect("write");
        assert_eq!(detect_ecosystem(dir.path()), Some(Ecosystem::Rust));
    }

    #[test]
    fn no_marker_yields_none() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(detect_ecosystem(dir.path()), None);
    }

    #[test]
    fn explicit_commands_override_detection() {
        let cmds = ValidationCommands::resolve(
            Some("make lint".to_string()),
            None,
            Some(Ecosystem::Python),
        );
        assert_eq!(cmds.lint.as_deref(), Some("make lint"));
        assert_eq!(cmds.test.as_deref(), Some("pytest -q"));
        assert_eq!(cmds.ordered(), vec!["make lint", "pytest -q"]);
    }

    #[test]
    fn no_commands_without_config_or_markers() {
        let cmds = ValidationCommands::resolve(None, None, None);
        assert!(cmds.is_empty());
    }

    #[test]
    fn command_validator_reports_pass_and_fail() {
        let dir = TempDir::new().expect("tempdir");
        let validator = CommandValidator::new(dir.path(), Duration::from_secs(10));

        let ok = validator.run("true").expect("run");
        assert!(ok.passed);
        assert_eq!(ok.exit_code, Some(0));

        let bad = validator.run("echo broken >&2; exit 3").expect("run");
        assert!(!bad.passed);
        assert_eq!(bad.exit_code, Some(3));
        assert!(bad.output.contains("broken"));
    }
}
