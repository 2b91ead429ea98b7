//! Prompt rendering for agent and refiner invocations.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::task::Task;
use crate::core::types::ValidationResult;

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");
const REFINE_DRAFT_TEMPLATE: &str = include_str!("prompts/refine_draft.md");
const REFINE_SCORE_TEMPLATE: &str = include_str!("prompts/refine_score.md");

/// Keep validation output in fix prompts below this many bytes, tail end
/// preferred since build tools print the actionable errors last.
const FIX_OUTPUT_LIMIT: usize = 8_000;

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .expect("task template should be valid");
        env.add_template("fix", FIX_TEMPLATE)
            .expect("fix template should be valid");
        env.add_template("refine_draft", REFINE_DRAFT_TEMPLATE)
            .expect("refine_draft template should be valid");
        env.add_template("refine_score", REFINE_SCORE_TEMPLATE)
            .expect("refine_score template should be valid");
        Self { env }
    }

    /// Primary attempt prompt for a task.
    pub fn render_task(&self, task: &Task) -> Result<String> {
        let rendered = self.env.get_template("task")?.render(context! {
            title => task.title,
            body => task.prompt.trim(),
        })?;
        Ok(rendered)
    }

    /// Fix-retry prompt embedding the failing validation output.
    pub fn render_fix(&self, task: &Task, failure: &ValidationResult) -> Result<String> {
        let rendered = self.env.get_template("fix")?.render(context! {
            title => task.title,
            body => task.prompt.trim(),
            command => failure.command,
            exit_code => failure.exit_code,
            output => tail(&failure.output, FIX_OUTPUT_LIMIT),
        })?;
        Ok(rendered)
    }

    /// Refiner drafting prompt; later iterations carry the previous draft
    /// and its score.
    pub fn render_refine_draft(
        &self,
        task: &Task,
        previous: Option<(&str, u8)>,
        search_context: Option<&str>,
    ) -> Result<String> {
        let rendered = self.env.get_template("refine_draft")?.render(context! {
            title => task.title,
            body => task.prompt.trim(),
            previous_draft => previous.map(|(draft, _)| draft),
            previous_score => previous.map(|(_, score)| score),
            search_context => search_context.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    /// Self-scoring prompt for a draft.
    pub fn render_refine_score(&self, draft: &str) -> Result<String> {
        let rendered = self.env.get_template("refine_score")?.render(context! {
            draft => draft.trim(),
        })?;
        Ok(rendered)
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Last `limit` bytes of `text`, on a char boundary.
fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
