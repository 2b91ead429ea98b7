//! Prompt refinement: draft, self-score, repeat until good enough.
//!
//! The refiner runs before dispatch in prompt-loop mode. A draft is
//! produced by the local model, scored 0-10 by the same model, and
//! redrafted while the score is below the threshold. The iteration cap
//! guarantees termination; when it is hit the best-scoring draft wins.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::task::Task;
use crate::io::llm::{LocalModel, SearchProvider};
use crate::io::prompt::PromptEngine;

pub const DEFAULT_SCORE_THRESHOLD: u8 = 8;
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Result of refining one task prompt.
#[derive(Debug, Clone)]
pub struct RefineOutcome {
    /// The text that replaces the task prompt.
    pub prompt: String,
    pub score: u8,
    pub iterations: u32,
    /// False when the iteration cap forced acceptance of the best draft.
    pub reached_threshold: bool,
}

pub struct Refiner<'a> {
    llm: &'a dyn LocalModel,
    /// Consulted once per task, only when explicitly enabled in config.
    search: Option<&'a dyn SearchProvider>,
    engine: PromptEngine,
    score_threshold: u8,
    max_iterations: u32,
}

impl<'a> Refiner<'a> {
    pub fn new(
        llm: &'a dyn LocalModel,
        search: Option<&'a dyn SearchProvider>,
        score_threshold: u8,
        max_iterations: u32,
    ) -> Self {
        Self {
            llm,
            search,
            engine: PromptEngine::new(),
            score_threshold,
            max_iterations: max_iterations.max(1),
        }
    }

    /// Refine a task's prompt. Errors from the model propagate; callers
    /// treat them as a warning and keep the original prompt.
    #[instrument(skip_all, fields(task_id = task.id))]
    pub fn refine(&self, task: &Task) -> Result<RefineOutcome> {
        let search_context = match self.search {
            Some(provider) => {
                let context = provider
                    .search(&task.title)
                    .context("search collaborator failed")?;
                debug!(context_len = context.len(), "search context fetched");
                Some(context)
            }
            None => None,
        };

        let mut previous: Option<(String, u8)> = None;
        let mut best: Option<(String, u8)> = None;

        for iteration in 1..=self.max_iterations {
            let draft_prompt = self.engine.render_refine_draft(
                task,
                previous.as_ref().map(|(d, s)| (d.as_str(), *s)),
                search_context.as_deref(),
            )?;
            let draft = self
                .llm
                .complete(&draft_prompt)
                .with_context(|| format!("draft iteration {iteration}"))?;

            let score_prompt = self.engine.render_refine_score(&draft)?;
            let score_text = self
                .llm
                .complete(&score_prompt)
                .with_context(|| format!("score iteration {iteration}"))?;
            let score = parse_score(&score_text);
            debug!(iteration, score, "draft scored");

            if best.as_ref().is_none_or(|(_, s)| score > *s) {
                best = Some((draft.clone(), score));
            }
            if score >= self.score_threshold {
                info!(iteration, score, "prompt refined");
                return Ok(RefineOutcome {
                    prompt: draft,
                    score,
                    iterations: iteration,
                    reached_threshold: true,
                });
            }
            previous = Some((draft, score));
        }

        let (prompt, score) = best.unwrap_or_else(|| (task.prompt.clone(), 0));
        warn!(score, iterations = self.max_iterations, "iteration cap hit, taking best draft");
        Ok(RefineOutcome {
            prompt,
            score,
            iterations: self.max_iterations,
            reached_threshold: false,
        })
    }
}

static SCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("valid score regex"));

/// First integer in the response, clamped to 0-10. Anything unparseable
/// scores 0 so a rambling model can never pass the threshold by accident.
pub fn parse_score(response: &str) -> u8 {
    SCORE_RE
        .find(response.trim())
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .map(|score| score.min(10))
        .unwrap_or(0)
}
