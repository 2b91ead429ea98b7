//! Test-only helpers: temp git repos and scripted collaborators.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::types::{ExecOutcome, ValidationResult};
use crate::io::executor::{AgentExecutor, ExecReport, ExecRequest, Usage};
use crate::io::llm::{LocalModel, SearchProvider};
use crate::io::monitor::MemoryPressure;
use crate::io::validation::ValidationRunner;

/// A throwaway git repository with one initial commit.
pub struct TestRepo {
    // Kept for drop-time cleanup; None when opened over an existing path.
    _dir: Option<TempDir>,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("create temp repo dir")?;
        let root = dir.path().to_path_buf();
        let repo = Self {
            _dir: Some(dir),
            root,
        };
        repo.git(&["init", "-b", "main"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "Test"])?;
        repo.commit_file("README.md", "# test repo\n", "initial commit")?;
        Ok(repo)
    }

    /// Reopen helpers over an existing repo path (no cleanup on drop).
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            _dir: None,
            root: root.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Write a file and commit it.
    pub fn commit_file(&self, rel: &str, contents: &str, message: &str) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents).with_context(|| format!("write {rel}"))?;
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-m", message])?;
        Ok(())
    }

    /// Write a markdown task file (uncommitted) and return its path.
    pub fn write_tasks(&self, contents: &str) -> Result<PathBuf> {
        let path = self.root.join("TASKS.md");
        std::fs::write(&path, contents).context("write TASKS.md")?;
        Ok(path)
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !status.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&status.stderr).trim()
            );
        }
        Ok(())
    }
}

/// One scripted executor attempt.
pub type ExecScript = Box<dyn Fn(&ExecRequest) -> Result<ExecReport> + Send + Sync>;

/// Executor that plays back a fixed sequence of attempt outcomes.
pub struct ScriptedExecutor {
    scripts: Vec<ExecScript>,
    next: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(scripts: Vec<ExecScript>) -> Self {
        Self {
            scripts,
            next: AtomicUsize::new(0),
        }
    }

    /// `n` attempts that complete without touching the repo.
    pub fn completed(n: usize) -> Self {
        let scripts = (0..n)
            .map(|_| -> ExecScript { Box::new(|_req| Ok(report(ExecOutcome::Completed))) })
            .collect();
        Self::new(scripts)
    }

    /// Attempts run so far.
    pub fn calls(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }
}

impl AgentExecutor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecReport> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .get(index)
            .ok_or_else(|| anyhow!("unscripted executor attempt {}", index + 1))?;
        script(request)
    }
}

/// Report with the given outcome and no usage or output.
pub fn report(outcome: ExecOutcome) -> ExecReport {
    ExecReport {
        outcome,
        usage: Usage::default(),
        output: String::new(),
    }
}

/// Local model that plays back canned responses in order.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
    failure: Option<String>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
            failure: None,
        }
    }

    /// Model whose every call fails with the given message.
    pub fn failing(message: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            failure: Some(message.to_string()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LocalModel for ScriptedLlm {
    fn complete(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            bail!("{message}");
        }
        self.responses
            .lock()
            .map_err(|_| anyhow!("poisoned scripted llm"))?
            .pop_front()
            .ok_or_else(|| anyhow!("unscripted llm call"))
    }
}

/// Search collaborator that returns a fixed snippet and counts calls.
pub struct ScriptedSearch {
    pub snippet: String,
    calls: AtomicUsize,
}

impl ScriptedSearch {
    pub fn new(snippet: &str) -> Self {
        Self {
            snippet: snippet.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SearchProvider for ScriptedSearch {
    fn search(&self, _query: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.snippet.clone())
    }
}

/// Validation runner that plays back pass/fail verdicts in order.
pub struct ScriptedValidator {
    verdicts: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
}

impl ScriptedValidator {
    pub fn new(verdicts: Vec<bool>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Validator that fails every command it is asked to run.
    pub fn always_failing() -> Self {
        Self {
            verdicts: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ValidationRunner for ScriptedValidator {
    fn run(&self, command: &str) -> Result<ValidationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let passed = self
            .verdicts
            .lock()
            .map_err(|_| anyhow!("poisoned scripted validator"))?
            .pop_front()
            .unwrap_or(false);
        Ok(ValidationResult {
            command: command.to_string(),
            exit_code: Some(if passed { 0 } else { 1 }),
            output: if passed {
                "ok".to_string()
            } else {
                "scripted failure".to_string()
            },
            passed,
        })
    }
}

/// Memory pressure stub; defaults to clear.
pub struct StubPressure {
    over: std::sync::atomic::AtomicBool,
}

impl StubPressure {
    pub fn clear() -> Self {
        Self {
            over: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_over(&self, over: bool) {
        self.over.store(over, Ordering::SeqCst);
    }
}

impl MemoryPressure for StubPressure {
    fn over_threshold(&self) -> bool {
        self.over.load(Ordering::SeqCst)
    }
}
