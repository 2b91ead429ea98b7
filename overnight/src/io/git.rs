//! Git adapter for the overnight session.
//!
//! Checkpoints, rollback, and attribution of agent commits all go through
//! git, so we keep a small, explicit wrapper around `git` subprocess calls.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True if the working directory is inside a git worktree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Return the full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// List commit SHAs reachable from `to` but not from `from`, oldest first.
    pub fn commits_between(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let range = format!("{from}..{to}");
        let out = self.run_capture(&["rev-list", "--reverse", &range])?;
        Ok(out.lines().map(|l| l.trim().to_string()).collect())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let entries = self.status_porcelain()?;
        let mut disallowed = Vec::new();
        for entry in entries {
            if allowed_prefixes
                .iter()
                .any(|prefix| entry.path.starts_with(prefix))
            {
                continue;
            }
            disallowed.push(entry);
        }
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean (disallowed changes):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Create a lightweight tag at the given commit, replacing any existing
    /// tag with the same name.
    #[instrument(skip_all, fields(tag))]
    pub fn tag_at(&self, tag: &str, commit: &str) -> Result<()> {
        debug!(tag, commit, "tagging commit");
        self.run_checked(&["tag", "--force", tag, commit])?;
        Ok(())
    }

    /// Tag names matching the given glob pattern.
    pub fn list_tags(&self, pattern: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["tag", "-l", pattern])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Hard-reset the worktree and index to the given commit.
    ///
    /// Untracked files are left alone so the durable state directory
    /// survives a rollback.
    #[instrument(skip_all, fields(commit))]
    pub fn reset_hard(&self, commit: &str) -> Result<()> {
        warn!(commit, "hard reset");
        self.run_checked(&["reset", "--hard", commit])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn commits_between_lists_oldest_first() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let base = git.head_sha().expect("head");
        repo.commit_file("a.txt", "a", "first").expect("commit");
        let first = git.head_sha().expect("head");
        repo.commit_file("b.txt", "b", "second").expect("commit");
        let second = git.head_sha().expect("head");

        let commits = git.commits_between(&base, &second).expect("range");
        assert_eq!(commits, vec![first, second]);
    }

    #[test]
    fn reset_hard_moves_head_back() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let base = git.head_sha().expect("head");
        repo.commit_file("a.txt", "a", "first").expect("commit");
        assert_ne!(git.head_sha().expect("head"), base);

        git.reset_hard(&base).expect("reset");
        assert_eq!(git.head_sha().expect("head"), base);
    }

    #[test]
    fn branch_checkout_round_trip() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        assert!(!git.branch_exists("overnight-20260829").expect("check"));

        git.checkout_new_branch("overnight-20260829").expect("create");
        assert!(git.branch_exists("overnight-20260829").expect("check"));

        git.checkout_branch("main").expect("back to main");
        git.checkout_branch("overnight-20260829").expect("existing");
    }

    #[test]
    fn clean_check_allows_listed_prefixes_only() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        git.ensure_clean_except_prefixes(&[]).expect("clean");

        std::fs::create_dir_all(repo.path().join(".overnight")).expect("mkdir");
        std::fs::write(repo.path().join(".overnight/run_state.json"), "{}").expect("write");
        git.ensure_clean_except_prefixes(&[".overnight"]).expect("allowed");

        std::fs::write(repo.path().join("stray.txt"), "x").expect("write");
        let err = git
            .ensure_clean_except_prefixes(&[".overnight"])
            .expect_err("dirty");
        assert!(err.to_string().contains("stray.txt"));
    }

    #[test]
    fn tag_at_is_reapplied_idempotently() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let base = git.head_sha().expect("head");
        git.tag_at("overnight-ckpt-1", &base).expect("tag");
        git.tag_at("overnight-ckpt-1", &base).expect("retag");
    }
}
