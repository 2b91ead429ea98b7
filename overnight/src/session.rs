//! The overnight session: drives all tasks from start (or resume) to a
//! final verdict.
//!
//! One thread, strictly sequential tasks. Every state transition is
//! persisted before the next side effect, so killing the process at any
//! point leaves `.overnight/run_state.json` loadable by `--resume`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::router::{RoutePolicy, select_model};
use crate::core::state::{RollbackTarget, RunState};
use crate::core::stats::OutcomeRecord;
use crate::core::task::Task;
use crate::core::types::{ExecOutcome, FailureReason, ModelId, TaskStatus, ValidationResult};
use crate::io::checkpoint::CheckpointManager;
use crate::io::config::RunConfig;
use crate::io::executor::{AgentExecutor, ExecRequest, execute_with_commits};
use crate::io::git::Git;
use crate::io::history::HistoryLog;
use crate::io::interrupt;
use crate::io::llm::{LocalModel, SearchProvider};
use crate::io::monitor::MemoryPressure;
use crate::io::prompt::PromptEngine;
use crate::io::run_store::RunStore;
use crate::io::tasks::parse_task_file;
use crate::io::validation::{ValidationCommands, ValidationRunner, detect_ecosystem};
use crate::refine::Refiner;
use crate::report;

/// CLI-level inputs for one `overnight run`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub project: PathBuf,
    pub tasks_file: PathBuf,
    pub branch: Option<String>,
    pub hybrid: bool,
    pub prompt_loop: bool,
    pub resume: bool,
    pub dry_run: bool,
    pub report_path: Option<PathBuf>,
}

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    AllSucceeded,
    CompletedWithFailures,
    Aborted,
    Interrupted,
}

impl RunVerdict {
    pub fn exit_code(self) -> i32 {
        use crate::exit_codes;
        match self {
            RunVerdict::AllSucceeded => exit_codes::OK,
            RunVerdict::CompletedWithFailures => exit_codes::COMPLETED_WITH_FAILURES,
            RunVerdict::Aborted => exit_codes::ABORTED,
            RunVerdict::Interrupted => exit_codes::INTERRUPTED,
        }
    }
}

/// Rollback could not restore the worktree. Fatal: the repository may be
/// in a state no checkpoint describes.
#[derive(Debug)]
pub struct RollbackFailure {
    pub detail: String,
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rollback failed: {}", self.detail)
    }
}

impl std::error::Error for RollbackFailure {}

/// Collaborators the session drives. Trait objects so tests can script
/// every seam.
pub struct SessionDeps<'a> {
    pub executor: &'a dyn AgentExecutor,
    pub validator: &'a dyn ValidationRunner,
    pub pressure: &'a dyn MemoryPressure,
    /// Local model for prompt refinement; `None` disables prompt-loop mode
    /// even when requested.
    pub refine_llm: Option<&'a dyn LocalModel>,
    /// Remote search collaborator for the refiner. Consulted only when
    /// `refine_remote_search` is set in config.
    pub search: Option<&'a dyn SearchProvider>,
}

/// Terminal result of one task, with enough context to classify the
/// failure for the outcome history.
struct TaskOutcome {
    status: TaskStatus,
    failing_validation: Option<ValidationResult>,
}

/// Run the whole session and return the final verdict.
///
/// Fatal conditions (corrupt resume state, rollback failure, unusable
/// project) surface as errors; everything task-level becomes part of the
/// verdict instead.
#[instrument(skip_all, fields(project = %options.project.display(), resume = options.resume))]
pub fn run_session(
    options: &RunOptions,
    config: &RunConfig,
    deps: &SessionDeps,
) -> Result<RunVerdict> {
    config.validate()?;
    let git = Git::new(&options.project);
    let store = RunStore::new(&options.project);

    preflight(options, &git, &store)?;

    if options.dry_run {
        return dry_run_plan(options, config);
    }

    let mut state = if options.resume {
        let state = store.load().context("resume run")?;
        git.checkout_branch(&state.branch)
            .with_context(|| format!("checkout run branch {}", state.branch))?;
        info!(run_id = %state.run_id, current_index = state.current_index, "resuming run");
        state
    } else {
        start_fresh(options, &git)?
    };

    let ecosystem = detect_ecosystem(&options.project);
    let commands = ValidationCommands::resolve(
        config.lint_cmd.clone(),
        config.test_cmd.clone(),
        ecosystem,
    );
    if commands.is_empty() {
        state
            .warnings
            .push("no validation commands configured or detected".to_string());
    }

    let policy = RoutePolicy {
        local_model: ModelId::new(config.model.clone()),
        remote_model: ModelId::new(config.remote_model.clone()),
        remote_first_k: config.remote_first_k,
        hybrid: state.hybrid,
    };
    let history = HistoryLog::new(store.history_path());
    record_advisories(&mut state, &history)?;
    store.save(&state)?;

    let engine = PromptEngine::new();
    let checkpoints = CheckpointManager::new(&git);

    while let Some(index) = state.next_pending() {
        if interrupt::is_interrupted() {
            info!("interrupt observed before dispatch, stopping");
            store.save(&state)?;
            return Ok(RunVerdict::Interrupted);
        }

        wait_for_memory(&mut state, config, deps);
        let outcome = dispatch_task(
            &mut state, index, options, config, deps, &git, &store, &commands, &policy, &engine,
        )?;

        let ended = Utc::now();
        state.tasks[index].ended_at = Some(ended);
        state.record_outcome(index, outcome.status);

        if outcome.status == TaskStatus::Interrupted {
            // Not advanced: resume restarts exactly this task.
            store.save(&state)?;
            info!(task_id = state.tasks[index].id, "task interrupted, state saved for resume");
            return Ok(RunVerdict::Interrupted);
        }

        if outcome.status == TaskStatus::Succeeded {
            checkpoints
                .create(&mut state, index)
                .context("create checkpoint")?;
        }
        record_history(&history, &state.tasks[index], &outcome, &commands)?;
        state.advance(index);
        store.save(&state)?;

        if state.consecutive_failures >= config.max_failures {
            warn!(
                consecutive_failures = state.consecutive_failures,
                "failure limit reached, aborting run"
            );
            return abort_run(&mut state, &store, &checkpoints, options);
        }
    }

    finish_run(&mut state, &store, &history, options)
}

fn preflight(options: &RunOptions, git: &Git, store: &RunStore) -> Result<()> {
    if !options.project.is_dir() {
        bail!("project path {} does not exist", options.project.display());
    }
    if !git.is_repo() {
        bail!("{} is not a git repository", options.project.display());
    }
    if options.resume {
        if !store.has_state() {
            bail!("nothing to resume: no run state under {}", store.root().display());
        }
    } else if !options.tasks_file.is_file() {
        bail!("tasks file {} does not exist", options.tasks_file.display());
    }
    Ok(())
}

/// Parse tasks, set up the run branch, and persist the initial state.
fn start_fresh(options: &RunOptions, git: &Git) -> Result<RunState> {
    let tasks = parse_task_file(&options.tasks_file)?;

    let branch = options
        .branch
        .clone()
        .unwrap_or_else(|| format!("overnight-{}", Utc::now().format("%Y%m%d")));
    if git.branch_exists(&branch)? {
        git.checkout_branch(&branch)?;
    } else {
        git.checkout_new_branch(&branch)?;
    }
    let base_commit = git.head_sha().context("resolve base commit")?;

    let run_id = format!("run-{}", Utc::now().format("%Y%m%d-%H%M%S"));
    let mut state = RunState::new(
        run_id,
        &options.project,
        options.tasks_file.display().to_string(),
        branch,
        base_commit,
        tasks,
    );
    state.hybrid = options.hybrid;
    state.prompt_loop = options.prompt_loop;
    state.dry_run = options.dry_run;

    // Dirty worktree is a warning, not a blocker; agent commits will be
    // attributed correctly regardless.
    if let Err(e) = git.ensure_clean_except_prefixes(&[".overnight"]) {
        warn!("starting with a dirty worktree");
        state.warnings.push(format!("dirty worktree at start: {e:#}"));
    }

    info!(run_id = %state.run_id, task_count = state.tasks.len(), "run started");
    Ok(state)
}

/// Print the planned task -> model sequence. Touches nothing: no branch,
/// no state file, no agent.
fn dry_run_plan(options: &RunOptions, config: &RunConfig) -> Result<RunVerdict> {
    let tasks = parse_task_file(&options.tasks_file)?;
    let branch = options
        .branch
        .clone()
        .unwrap_or_else(|| format!("overnight-{}", Utc::now().format("%Y%m%d")));
    let policy = RoutePolicy {
        local_model: ModelId::new(config.model.clone()),
        remote_model: ModelId::new(config.remote_model.clone()),
        remote_first_k: config.remote_first_k,
        hybrid: options.hybrid,
    };
    println!("dry run: {} tasks on branch {branch}", tasks.len());
    for (index, task) in tasks.iter().enumerate() {
        let model = select_model(index, task, &policy);
        println!(
            "  {}. [{}] {} -> {}",
            task.id,
            task.category.as_str(),
            task.title,
            model
        );
    }
    Ok(RunVerdict::AllSucceeded)
}

/// Surface low-success-rate advisories from history as warnings. The
/// session never skips a task on its own.
fn record_advisories(state: &mut RunState, history: &HistoryLog) -> Result<()> {
    let stats = history.query()?;
    let mut seen = std::collections::HashSet::new();
    for task in &state.tasks {
        if seen.insert(task.category) && stats.skip_category(task.category) {
            let tally = stats.category(task.category);
            let advice = format!(
                "history: category '{}' succeeds {:.0}% of the time over {} attempts; consider deferring those tasks",
                task.category.as_str(),
                tally.rate() * 100.0,
                tally.attempts
            );
            info!("{advice}");
            state.warnings.push(advice);
        }
    }
    Ok(())
}

fn wait_for_memory(state: &mut RunState, config: &RunConfig, deps: &SessionDeps) {
    if !deps.pressure.over_threshold() {
        return;
    }
    let max_wait = Duration::from_secs(config.memory_max_wait_secs);
    if !deps.pressure.wait_until_clear(max_wait) {
        state.warnings.push(format!(
            "memory still over {:.0}% after {}s, dispatching anyway",
            config.memory_threshold_percent, config.memory_max_wait_secs
        ));
    }
}

/// Execute one task end-to-end: primary attempt plus validation fix
/// retries. Failed and timed-out attempts share the fix budget when
/// validation is configured; crashes are terminal.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(task_id = state.tasks[index].id))]
fn dispatch_task(
    state: &mut RunState,
    index: usize,
    options: &RunOptions,
    config: &RunConfig,
    deps: &SessionDeps,
    git: &Git,
    store: &RunStore,
    commands: &ValidationCommands,
    policy: &RoutePolicy,
    engine: &PromptEngine,
) -> Result<TaskOutcome> {
    let model = select_model(index, &state.tasks[index], policy);
    info!(title = %state.tasks[index].title, model = %model, "dispatching task");

    refine_prompt(state, index, config, deps);

    {
        let task = &mut state.tasks[index];
        task.model = Some(model.clone());
        task.status = TaskStatus::Dispatched;
        task.started_at = Some(Utc::now());
    }
    store.save(state)?;

    let task_id = state.tasks[index].id;
    let mut prompt = engine.render_task(&state.tasks[index])?;
    let mut fix_used = 0u32;

    loop {
        wait_for_memory(state, config, deps);
        let attempt = state.tasks[index].attempts + 1;
        let request = ExecRequest {
            workdir: options.project.clone(),
            prompt: prompt.clone(),
            model: model.clone(),
            log_path: store
                .logs_dir()
                .join(format!("task-{task_id}-attempt-{attempt}.log")),
            timeout: Duration::from_secs(config.task_timeout_secs),
            output_limit_bytes: config.agent_output_limit_bytes,
        };

        let (exec, commits) = execute_with_commits(deps.executor, git, &request)?;
        {
            let task = &mut state.tasks[index];
            task.attempts += 1;
            task.tokens_sent += exec.usage.tokens_sent;
            task.tokens_received += exec.usage.tokens_received;
            task.cost += exec.usage.cost;
            task.commits.extend(commits);
        }
        store.save(state)?;

        match exec.outcome {
            // Without validation commands there is nothing to repair against,
            // so a failed or timed-out agent is terminal.
            ExecOutcome::Failed { exit_code } if commands.is_empty() => {
                state.tasks[index].error = Some(format!("agent exited with code {exit_code}"));
                return Ok(TaskOutcome {
                    status: TaskStatus::Failed,
                    failing_validation: None,
                });
            }
            ExecOutcome::TimedOut if commands.is_empty() => {
                state.tasks[index].error = Some(format!(
                    "agent timed out after {}s",
                    config.task_timeout_secs
                ));
                return Ok(TaskOutcome {
                    status: TaskStatus::TimedOut,
                    failing_validation: None,
                });
            }
            // Failed and timed-out attempts may still have left usable
            // commits; validation decides, with the same fix budget.
            ExecOutcome::Completed | ExecOutcome::Failed { .. } | ExecOutcome::TimedOut => {
                if !matches!(exec.outcome, ExecOutcome::Completed) {
                    warn!(outcome = ?exec.outcome, "agent attempt did not complete, validating anyway");
                }
                let Some(failure) = run_validation(deps.validator, commands)? else {
                    return Ok(TaskOutcome {
                        status: TaskStatus::Succeeded,
                        failing_validation: None,
                    });
                };
                if fix_used < config.fix_retries {
                    fix_used += 1;
                    info!(
                        fix_attempt = fix_used,
                        command = %failure.command,
                        "validation failed, retrying with fix prompt"
                    );
                    prompt = engine.render_fix(&state.tasks[index], &failure)?;
                    continue;
                }
                warn!(command = %failure.command, "validation retries exhausted");
                state.tasks[index].error = Some(format!(
                    "validation '{}' still failing after {} fix retries",
                    failure.command, config.fix_retries
                ));
                return Ok(TaskOutcome {
                    status: TaskStatus::FailedWithWarnings,
                    failing_validation: Some(failure),
                });
            }
            ExecOutcome::Crashed => {
                state.tasks[index].error = Some("agent crashed".to_string());
                return Ok(TaskOutcome {
                    status: TaskStatus::Crashed,
                    failing_validation: None,
                });
            }
            ExecOutcome::Interrupted => {
                return Ok(TaskOutcome {
                    status: TaskStatus::Interrupted,
                    failing_validation: None,
                });
            }
        }
    }
}

/// Refine the task prompt in prompt-loop mode. Refinement trouble keeps
/// the original prompt and records a warning.
fn refine_prompt(state: &mut RunState, index: usize, config: &RunConfig, deps: &SessionDeps) {
    if !state.prompt_loop {
        return;
    }
    let Some(llm) = deps.refine_llm else {
        return;
    };
    let search = if config.refine_remote_search {
        deps.search
    } else {
        None
    };
    let refiner = Refiner::new(
        llm,
        search,
        config.refine_score_threshold,
        config.refine_max_iterations,
    );
    match refiner.refine(&state.tasks[index]) {
        Ok(outcome) => {
            info!(
                score = outcome.score,
                iterations = outcome.iterations,
                "task prompt refined"
            );
            state.tasks[index].prompt = outcome.prompt;
        }
        Err(e) => {
            warn!(err = %format!("{e:#}"), "prompt refinement failed, keeping original");
            state.warnings.push(format!(
                "prompt refinement failed for task {}: {e:#}",
                state.tasks[index].id
            ));
        }
    }
}

/// Lint then test; first failure wins.
fn run_validation(
    validator: &dyn ValidationRunner,
    commands: &ValidationCommands,
) -> Result<Option<ValidationResult>> {
    for command in commands.ordered() {
        let result = validator.run(command)?;
        if !result.passed {
            return Ok(Some(result));
        }
    }
    Ok(None)
}

fn record_history(
    history: &HistoryLog,
    task: &Task,
    outcome: &TaskOutcome,
    commands: &ValidationCommands,
) -> Result<()> {
    let failure_reason = match outcome.status {
        TaskStatus::Succeeded => None,
        TaskStatus::Failed => Some(FailureReason::ExecFailed),
        TaskStatus::TimedOut => Some(FailureReason::Timeout),
        TaskStatus::Crashed => Some(FailureReason::Crash),
        TaskStatus::FailedWithWarnings => {
            let lint_failed = outcome
                .failing_validation
                .as_ref()
                .map(|v| commands.lint.as_deref() == Some(v.command.as_str()))
                .unwrap_or(false);
            Some(if lint_failed {
                FailureReason::LintFailed
            } else {
                FailureReason::TestFailed
            })
        }
        _ => return Ok(()),
    };
    history.record(&OutcomeRecord {
        category: task.category,
        success: outcome.status == TaskStatus::Succeeded,
        duration_secs: task.duration_secs(),
        commits: task.commits.len() as u32,
        failure_reason,
        model: task
            .model
            .clone()
            .unwrap_or_else(|| ModelId::new("unknown")),
        timestamp: Utc::now(),
    })
}

/// Abort path: roll back to the last good checkpoint and stop.
fn abort_run(
    state: &mut RunState,
    store: &RunStore,
    checkpoints: &CheckpointManager,
    options: &RunOptions,
) -> Result<RunVerdict> {
    let target = checkpoints.rollback(state).map_err(|e| {
        anyhow::Error::new(RollbackFailure {
            detail: format!("{e:#}"),
        })
    })?;
    let landed = match &target {
        RollbackTarget::Checkpoint(ckpt) => format!("checkpoint {}", ckpt.tag),
        RollbackTarget::BaseCommit(commit) => format!("base commit {commit}"),
    };
    state.warnings.push(format!(
        "aborted after {} consecutive failures; rolled back to {landed}",
        state.consecutive_failures
    ));
    store.save(state)?;
    write_report(state, store, options)?;
    store.archive(state)?;
    Ok(RunVerdict::Aborted)
}

/// Normal end of run: report, advisories, archive.
fn finish_run(
    state: &mut RunState,
    store: &RunStore,
    history: &HistoryLog,
    options: &RunOptions,
) -> Result<RunVerdict> {
    let stats = history.query()?;
    if stats.suggest_model_switch() {
        let advice = format!(
            "history: overall success rate {:.0}% over {} attempts; consider a more capable model",
            stats.overall.rate() * 100.0,
            stats.overall.attempts
        );
        info!("{advice}");
        state.warnings.push(advice);
    }

    store.save(state)?;
    write_report(state, store, options)?;
    let verdict = if state.all_succeeded() {
        RunVerdict::AllSucceeded
    } else {
        RunVerdict::CompletedWithFailures
    };
    store.archive(state)?;
    info!(
        succeeded = state.succeeded_count(),
        total = state.tasks.len(),
        "run finished"
    );
    Ok(verdict)
}

fn write_report(state: &RunState, store: &RunStore, options: &RunOptions) -> Result<()> {
    let path = options
        .report_path
        .clone()
        .unwrap_or_else(|| store.reports_dir().join(format!("{}.md", state.run_id)));
    report::write_report(&path, state).context("write run report")?;
    info!(path = %path.display(), "report written");
    Ok(())
}
