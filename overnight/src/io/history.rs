//! Append-only outcome history (`.overnight/history.jsonl`).
//!
//! One JSON object per line, one line per finished task, across runs.
//! Aggregates are always derived by re-reading and folding the whole file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::stats::{AggregateStats, OutcomeRecord};

#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush.
    #[instrument(skip_all, fields(category = record.category.as_str()))]
    pub fn record(&self, record: &OutcomeRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create history dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open history {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append history {}", self.path.display()))?;
        file.flush().context("flush history")?;
        debug!("outcome recorded");
        Ok(())
    }

    /// Load all records, skipping lines that no longer parse.
    ///
    /// A torn final line (crash mid-append) must not poison the history,
    /// so bad lines are logged and dropped rather than failing the load.
    pub fn load(&self) -> Result<Vec<OutcomeRecord>> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read history {}", self.path.display()))?;
        let mut records = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OutcomeRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(lineno = lineno + 1, err = %e, "skipping unparseable history line"),
            }
        }
        debug!(record_count = records.len(), "history loaded");
        Ok(records)
    }

    /// Fresh fold over the entire history.
    pub fn query(&self) -> Result<AggregateStats> {
        Ok(AggregateStats::fold(&self.load()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskCategory;
    use crate::core::types::{FailureReason, ModelId};
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(category: TaskCategory, success: bool) -> OutcomeRecord {
        OutcomeRecord {
            category,
            success,
            duration_secs: 60,
            commits: u32::from(success),
            failure_reason: (!success).then_some(FailureReason::TestFailed),
            model: ModelId::from("local-model"),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn appended_records_fold_into_stats() {
        let dir = TempDir::new().expect("tempdir");
        let log = HistoryLog::new(dir.path().join("history.jsonl"));

        log.record(&record(TaskCategory::BugFix, true)).expect("record");
        log.record(&record(TaskCategory::BugFix, false)).expect("record");
        log.record(&record(TaskCategory::Testing, true)).expect("record");

        let stats = log.query().expect("query");
        assert_eq!(stats.overall.attempts, 3);
        assert_eq!(stats.overall.successes, 2);
        assert_eq!(stats.category(TaskCategory::BugFix).attempts, 2);
    }

    #[test]
    fn missing_file_is_empty_history() {
        let dir = TempDir::new().expect("tempdir");
        let log = HistoryLog::new(dir.path().join("history.jsonl"));
        assert!(log.load().expect("load").is_empty());
        assert_eq!(log.query().expect("query").overall.attempts, 0);
    }

    #[test]
    fn torn_trailing_line_is_skipped() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("history.jsonl");
        let log = HistoryLog::new(&path);
        log.record(&record(TaskCategory::Feature, true)).expect("record");
        let mut contents = fs::read_to_string(&path).expect("read");
        contents.push_str("{\"category\":\"feat");
        fs::write(&path, contents).expect("write");

        let records = log.load().expect("load");
        assert_eq!(records.len(), 1);
    }
}
