//! Markdown run reports, written at the end of every run (and on abort).

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::state::RunState;
use crate::core::types::TaskStatus;

/// Render the run summary and write it atomically.
pub fn write_report(path: &Path, state: &RunState) -> Result<()> {
    let contents = render(state);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report directory {}", parent.display()))?;
    }
    let tmp = path.with_extension("md.tmp");
    fs::write(&tmp, contents).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

pub fn render(state: &RunState) -> String {
    let mut out = String::new();
    // Infallible: writing to a String cannot fail.
    let _ = writeln!(out, "# Overnight run {}", state.run_id);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Project: `{}`", state.project_path);
    let _ = writeln!(out, "- Branch: `{}`", state.branch);
    let _ = writeln!(out, "- Started: {}", state.started_at.to_rfc3339());
    let _ = writeln!(
        out,
        "- Tasks: {}/{} succeeded",
        state.succeeded_count(),
        state.tasks.len()
    );
    let breakdown = failure_breakdown(state);
    if !breakdown.is_empty() {
        let parts: Vec<String> = breakdown
            .iter()
            .map(|(status, n)| format!("{n} {}", status.as_str()))
            .collect();
        let _ = writeln!(out, "- Failures: {}", parts.join(", "));
    }
    let _ = writeln!(out, "- Commits: {}", state.total_commits());
    let (sent, received) = state.total_tokens();
    let _ = writeln!(out, "- Tokens: {sent} sent, {received} received");
    let _ = writeln!(out, "- Cost: ${:.4}", state.total_cost());
    let _ = writeln!(out);

    let _ = writeln!(out, "## Tasks");
    let _ = writeln!(out);
    let _ = writeln!(out, "| # | Task | Category | Status | Model | Attempts | Commits | Duration | Cost |");
    let _ = writeln!(out, "|---|------|----------|--------|-------|----------|---------|----------|------|");
    for task in &state.tasks {
        let model = task
            .model
            .as_ref()
            .map(|m| m.as_str())
            .unwrap_or("-");
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} | {} | {} | ${:.4} |",
            task.id,
            task.title,
            task.category.as_str(),
            task.status.as_str(),
            model,
            task.attempts,
            task.commits.len(),
            format_duration(task.duration_secs()),
            task.cost,
        );
    }
    let _ = writeln!(out);

    let failures: Vec<_> = state
        .tasks
        .iter()
        .filter(|t| t.status.is_failure())
        .collect();
    if !failures.is_empty() {
        let _ = writeln!(out, "## Failures");
        let _ = writeln!(out);
        for task in failures {
            let detail = task.error.as_deref().unwrap_or("no detail recorded");
            let _ = writeln!(out, "- Task {} ({}): {}", task.id, task.status.as_str(), detail);
        }
        let _ = writeln!(out);
    }

    if !state.checkpoints.is_empty() {
        let _ = writeln!(out, "## Checkpoints");
        let _ = writeln!(out);
        for ckpt in &state.checkpoints {
            let _ = writeln!(out, "- `{}` at `{}`", ckpt.tag, ckpt.commit);
        }
        let _ = writeln!(out);
    }

    if !state.warnings.is_empty() {
        let _ = writeln!(out, "## Warnings");
        let _ = writeln!(out);
        for warning in &state.warnings {
            let _ = writeln!(out, "- {warning}");
        }
        let _ = writeln!(out);
    }

    out
}

fn format_duration(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// Count tasks per terminal failure status, for the summary line.
pub fn failure_breakdown(state: &RunState) -> Vec<(TaskStatus, usize)> {
    [
        TaskStatus::Failed,
        TaskStatus::TimedOut,
        TaskStatus::Crashed,
        TaskStatus::FailedWithWarnings,
    ]
    .into_iter()
    .map(|status| (status, state.count_status(status)))
    .filter(|(_, n)| *n > 0)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Task;

    fn sample_state() -> RunState {
        let mut state = RunState::new(
            "run-20260829-010000",
            "/tmp/demo",
            "TASKS.md",
            "overnight-20260829",
            "abc123",
            vec![
                Task::new(1, "Fix the login bug", "fix it"),
                Task::new(2, "Add tests for parser", "add tests"),
            ],
        );
        state.tasks[0].status = TaskStatus::Succeeded;
        state.tasks[0].commits.push("def456".to_string());
        state.tasks[0].cost = 0.0123;
        state.tasks[0].tokens_sent = 4500;
        state.tasks[0].tokens_received = 812;
        state.tasks[1].status = TaskStatus::TimedOut;
        state.tasks[1].error = Some("agent timed out after 1800s".to_string());
        state.warnings.push("dirty worktree at start".to_string());
        state
    }

    #[test]
    fn render_includes_summary_and_failures() {
        let report = render(&sample_state());
        assert!(report.contains("# Overnight run run-20260829-010000"));
        assert!(report.contains("1/2 succeeded"));
        assert!(report.contains("- Failures: 1 timed_out"));
        assert!(report.contains("- Tokens: 4500 sent, 812 received"));
        assert!(report.contains("| 1 | Fix the login bug |"));
        assert!(report.contains("timed_out"));
        assert!(report.contains("## Failures"));
        assert!(report.contains("agent timed out after 1800s"));
        assert!(report.contains("## Warnings"));
    }

    #[test]
    fn write_report_creates_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reports").join("run.md");
        write_report(&path, &sample_state()).expect("write");
        let contents = std::fs::read_to_string(&path).expect("read");
        assert!(contents.starts_with("# Overnight run"));
    }

    #[test]
    fn failure_breakdown_counts_terminal_failures() {
        let breakdown = failure_breakdown(&sample_state());
        assert_eq!(breakdown, vec![(TaskStatus::TimedOut, 1)]);
    }
}
