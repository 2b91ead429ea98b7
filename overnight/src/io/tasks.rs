//! Task file parsing.
//!
//! Tasks live in a markdown file, one `## Task N: Title` (or bare
//! `## Title`) section each. The section body becomes the agent prompt;
//! sections that look like document metadata are skipped.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{debug, info, instrument};

use crate::core::task::Task;

/// Section titles that are document structure, not work.
const METADATA_TITLES: &[&str] = &["summary", "notes", "metadata", "config"];

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^##\s+(?:Task\s+\d+:\s+)?(.+)$").expect("valid header regex")
});

/// Parse the task file into ordered tasks with 1-based ids.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn parse_task_file(path: &Path) -> Result<Vec<Task>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task file {}", path.display()))?;
    let tasks = parse_tasks(&contents);
    if tasks.is_empty() {
        bail!("no tasks found in {}", path.display());
    }
    info!(task_count = tasks.len(), "parsed task file");
    Ok(tasks)
}

/// Split markdown into tasks. Each `##` section yields one task; the body
/// (or the title, for body-less sections) is the prompt.
pub fn parse_tasks(contents: &str) -> Vec<Task> {
    // (title, header start, body start); each body runs to the next header.
    let headers: Vec<(String, usize, usize)> = HEADER_RE
        .captures_iter(contents)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((caps[1].trim().to_string(), whole.start(), whole.end()))
        })
        .collect();

    let mut tasks = Vec::new();
    let mut id = 1u32;
    for (i, (title, _, body_start)) in headers.iter().enumerate() {
        if METADATA_TITLES.contains(&title.to_lowercase().as_str()) {
            debug!(title = %title, "skipping metadata section");
            continue;
        }
        let body_end = headers.get(i + 1).map_or(contents.len(), |next| next.1);
        let body = contents[*body_start..body_end].trim();
        let prompt = if body.is_empty() {
            title.clone()
        } else {
            body.to_string()
        };
        tasks.push(Task::new(id, title.clone(), prompt));
        id += 1;
    }
    tasks
}
