//! Executor abstraction for agent invocation.
//!
//! The [`AgentExecutor`] trait decouples session orchestration from the
//! actual agent backend (currently the `aider` CLI). Tests use scripted
//! executors that return predetermined outcomes without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ExecOutcome, ModelId};
use crate::io::git::Git;
use crate::io::interrupt;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text handed to the agent.
    pub prompt: String,
    /// Model the router selected for this attempt.
    pub model: ModelId,
    /// Path to write the agent stdout/stderr log.
    pub log_path: PathBuf,
    /// Hard wall-clock limit for the attempt.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Token and cost figures parsed from agent output.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub tokens_sent: u64,
    pub tokens_received: u64,
    /// Dollar cost of this attempt's messages.
    pub cost: f64,
}

/// What one agent attempt produced. The executor classifies the outcome
/// but never retries; retry policy lives in the session.
#[derive(Debug, Clone)]
pub struct ExecReport {
    pub outcome: ExecOutcome,
    pub usage: Usage,
    /// Combined stdout/stderr, bounded.
    pub output: String,
}

/// Abstraction over agent execution backends.
pub trait AgentExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecReport>;
}

/// Executor that spawns the `aider` CLI.
pub struct AiderExecutor;

impl AgentExecutor for AiderExecutor {
    #[instrument(skip_all, fields(model = %request.model, timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest) -> Result<ExecReport> {
        info!(workdir = %request.workdir.display(), "starting aider");

        let mut cmd = Command::new("aider");
        cmd.arg("--model")
            .arg(request.model.as_str())
            .arg("--yes")
            .arg("--auto-commits")
            .arg("--no-stream")
            .arg("--show-cost")
            .arg("--message")
            .arg(&request.prompt)
            .current_dir(&request.workdir);

        let output = match run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
            Some(interrupt::flag()),
        ) {
            Ok(output) => output,
            Err(e) => {
                // Spawn death: the agent never ran. Same class as a
                // signal kill from the session's point of view.
                warn!(err = %e, "aider failed to start");
                return Ok(ExecReport {
                    outcome: ExecOutcome::Crashed,
                    usage: Usage::default(),
                    output: format!("failed to start aider: {e:#}"),
                });
            }
        };

        write_agent_log(&request.log_path, &output, request.output_limit_bytes)?;

        let text = combined_output(&output);
        let usage = parse_usage(&text);
        let outcome = classify_outcome(&output);
        match &outcome {
            ExecOutcome::Completed => debug!("aider completed"),
            ExecOutcome::Failed { exit_code } => warn!(exit_code, "aider failed"),
            ExecOutcome::TimedOut => {
                warn!(timeout_secs = request.timeout.as_secs(), "aider timed out");
            }
            ExecOutcome::Crashed => warn!(signal = ?output.signal(), "aider crashed"),
            ExecOutcome::Interrupted => warn!("aider interrupted"),
        }

        Ok(ExecReport {
            outcome,
            usage,
            output: text,
        })
    }
}

fn classify_outcome(output: &CommandOutput) -> ExecOutcome {
    if output.interrupted {
        return ExecOutcome::Interrupted;
    }
    if output.timed_out {
        return ExecOutcome::TimedOut;
    }
    match output.exit_code() {
        Some(0) => ExecOutcome::Completed,
        Some(code) => ExecOutcome::Failed { exit_code: code },
        // No exit code means a signal we did not send.
        None => ExecOutcome::Crashed,
    }
}

/// Run one attempt and attribute commits by comparing HEAD before and
/// after. Exit codes are never trusted for commit attribution.
#[instrument(skip_all)]
pub fn execute_with_commits<E: AgentExecutor + ?Sized>(
    executor: &E,
    git: &Git,
    request: &ExecRequest,
) -> Result<(ExecReport, Vec<String>)> {
    let head_before = git.head_sha().context("resolve HEAD before attempt")?;
    let report = executor.exec(request)?;
    let head_after = git.head_sha().context("resolve HEAD after attempt")?;

    let commits = if head_before == head_after {
        Vec::new()
    } else {
        git.commits_between(&head_before, &head_after)
            .context("list attempt commits")?
    };
    debug!(commit_count = commits.len(), "attributed attempt commits");
    Ok((report, commits))
}

static TOKENS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)tokens:\s*([\d.,]+)(k?)\s*sent,\s*([\d.,]+)(k?)\s*received")
        .expect("valid tokens regex")
});
static COST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)cost:\s*\$([\d.]+)\s*message").expect("valid cost regex")
});

/// Parse token/cost lines the agent prints, summing across messages.
/// Lines look like `Tokens: 4.5k sent, 1.2k received.` and
/// `Cost: $0.0087 message, $0.026 session.`
pub fn parse_usage(output: &str) -> Usage {
    let mut usage = Usage::default();
    for caps in TOKENS_RE.captures_iter(output) {
        usage.tokens_sent += parse_count(&caps[1], &caps[2]);
        usage.tokens_received += parse_count(&caps[3], &caps[4]);
    }
    for caps in COST_RE.captures_iter(output) {
        if let Ok(cost) = caps[1].parse::<f64>() {
            usage.cost += cost;
        }
    }
    usage
}

fn parse_count(number: &str, suffix: &str) -> u64 {
    let number = number.replace(',', "");
    let value: f64 = number.parse().unwrap_or(0.0);
    let scale = if suffix.eq_ignore_ascii_case("k") {
        1000.0
    } else {
        1.0
    };
    (value * scale).round() as u64
}

fn combined_output(output: &CommandOutput) -> String {
    let mut text = output.stdout_lossy();
    let stderr = output.stderr_lossy();
    if !stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text.push_str(&output.truncated_notice("agent"));
    text
}

fn write_agent_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_lossy());
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_lossy());
    buf.push_str(&output.truncated_notice("agent"));
    if output.timed_out {
        buf.push_str("\n[agent timed out]\n");
    }
    if output.interrupted {
        buf.push_str("\n[agent interrupted]\n");
    }

    if buf.len() > output_limit {
        let kept = head(&buf, output_limit);
        let truncated = format!(
            "{}\n[truncated {} bytes]\n",
            kept,
            buf.len() - kept.len()
        );
        fs::write(path, truncated)
            .with_context(|| format!("write agent log {}", path.display()))?;
        return Ok(());
    }
    fs::write(path, buf).with_context(|| format!("write agent log {}", path.display()))
}

/// First `limit` bytes of `text`, backed off to a char boundary.
fn head(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedExecutor, TestRepo};

    #[test]
    fn agent_log_truncation_respects_char_boundaries() {
        use std::os::unix::process::ExitStatusExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.log");
        let output = CommandOutput {
            status: std::process::ExitStatus::from_raw(0),
            stdout: "é".repeat(64).into_bytes(),
            stderr: Vec::new(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out: false,
            interrupted: false,
        };

        // A limit landing inside a two-byte codepoint must not panic.
        write_agent_log(&path, &output, 30).expect("write log");
        let written = std::fs::read_to_string(&path).expect("read log");
        assert!(written.contains("[truncated"));
    }

    #[test]
    fn parses_plain_and_k_suffixed_tokens() {
        let usage = parse_usage("Tokens: 4.5k sent, 812 received.\nCost: $0.0087 message, $0.026 session.");
        assert_eq!(usage.tokens_sent, 4500);
        assert_eq!(usage.tokens_received, 812);
        assert!((usage.cost - 0.0087).abs() < 1e-9);
    }

    #[test]
    fn sums_usage_across_messages() {
        let output = "Tokens: 1k sent, 100 received.\nCost: $0.01 message, $0.01 session.\n\
                      Tokens: 2k sent, 200 received.\nCost: $0.02 message, $0.03 session.";
        let usage = parse_usage(output);
        assert_eq!(usage.tokens_sent, 3000);
        assert_eq!(usage.tokens_received, 300);
        assert!((usage.cost - 0.03).abs() < 1e-9);
    }

    #[test]
    fn no_usage_lines_yield_zeroes() {
        assert_eq!(parse_usage("no telemetry here"), Usage::default());
    }

    #[test]
    fn commit_attribution_uses_head_delta() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let request = ExecRequest {
            workdir: repo.path().to_path_buf(),
            prompt: "add a file".to_string(),
            model: ModelId::from("test-model"),
            log_path: repo.path().join(".overnight/logs/task-1.log"),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 4096,
        };

        let repo_path = repo.path().to_path_buf();
        let executor = ScriptedExecutor::new(vec![Box::new(move |_req| {
            let helper = TestRepo::open(&repo_path);
            helper.commit_file("agent.txt", "done", "agent work").expect("commit");
            Ok(ExecReport {
                outcome: ExecOutcome::Completed,
                usage: Usage::default(),
                output: "ok".to_string(),
            })
        })]);

        let (report, commits) = execute_with_commits(&executor, &git, &request).expect("exec");
        assert!(matches!(report.outcome, ExecOutcome::Completed));
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0], git.head_sha().expect("head"));
    }

    #[test]
    fn exit_code_without_commits_attributes_nothing() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let request = ExecRequest {
            workdir: repo.path().to_path_buf(),
            prompt: "noop".to_string(),
            model: ModelId::from("test-model"),
            log_path: repo.path().join(".overnight/logs/task-1.log"),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 4096,
        };

        let executor = ScriptedExecutor::completed(1);
        let (report, commits) = execute_with_commits(&executor, &git, &request).expect("exec");
        assert!(matches!(report.outcome, ExecOutcome::Completed));
        assert!(commits.is_empty());
    }
}
