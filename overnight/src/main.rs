//! Unattended sequential code-task runner.
//!
//! Works through a markdown task list with an external code-editing agent,
//! checkpointing after every success so a crashed or interrupted run can
//! be resumed with `--resume`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use overnight::core::types::ModelId;
use overnight::io::config::{RunConfig, load_config};
use overnight::io::executor::AiderExecutor;
use overnight::io::history::HistoryLog;
use overnight::io::interrupt;
use overnight::io::llm::OllamaCli;
use overnight::io::monitor::{DEFAULT_SAMPLE_INTERVAL, SysinfoMonitor};
use overnight::io::run_store::RunStore;
use overnight::io::validation::CommandValidator;
use overnight::session::{RunOptions, SessionDeps, run_session};
use overnight::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "overnight",
    version,
    about = "Unattended sequential code-task runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work through a task file, one task at a time.
    Run {
        /// Target project (a git repository).
        #[arg(long, default_value = ".")]
        project: PathBuf,
        /// Markdown task list (`## Task N: Title` sections).
        #[arg(long, default_value = "TASKS.md")]
        tasks: PathBuf,
        /// Run branch; defaults to `overnight-YYYYMMDD`.
        #[arg(long)]
        branch: Option<String>,
        /// Agent model; overrides the configured one.
        #[arg(long)]
        model: Option<String>,
        /// Per-attempt timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Lint command run after each attempt.
        #[arg(long)]
        lint_cmd: Option<String>,
        /// Test command run after each attempt.
        #[arg(long)]
        test_cmd: Option<String>,
        /// Validation retries after a failed lint/test.
        #[arg(long)]
        fix_retries: Option<u32>,
        /// Consecutive failures before the run aborts and rolls back.
        #[arg(long)]
        max_failures: Option<u32>,
        /// Route early and complex tasks to the remote model.
        #[arg(long)]
        hybrid: bool,
        /// Refine each task prompt with a local model before dispatch.
        #[arg(long)]
        prompt_loop: bool,
        /// Continue the interrupted run recorded under `.overnight/`.
        #[arg(long)]
        resume: bool,
        /// Print the task plan and exit without touching anything.
        #[arg(long)]
        dry_run: bool,
        /// Write the run report here instead of `.overnight/reports/`.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Summarize outcome history recorded by past runs.
    History {
        /// Target project (a git repository).
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
}

fn main() {
    logging::init();
    interrupt::install();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            project,
            tasks,
            branch,
            model,
            timeout,
            lint_cmd,
            test_cmd,
            fix_retries,
            max_failures,
            hybrid,
            prompt_loop,
            resume,
            dry_run,
            report,
        } => {
            let store = RunStore::new(&project);
            let mut config = load_config(&store.config_path())?;
            overlay(
                &mut config,
                model,
                timeout,
                lint_cmd,
                test_cmd,
                fix_retries,
                max_failures,
            );
            config.validate()?;

            let options = RunOptions {
                project: project.clone(),
                tasks_file: tasks,
                branch,
                hybrid,
                prompt_loop,
                resume,
                dry_run,
                report_path: report,
            };

            let executor = AiderExecutor;
            let validator = CommandValidator::new(
                &project,
                Duration::from_secs(config.validation_timeout_secs),
            );
            let pressure =
                SysinfoMonitor::spawn(config.memory_threshold_percent, DEFAULT_SAMPLE_INTERVAL);
            let refine_llm = prompt_loop.then(|| {
                // The config keeps aider-style model ids; the ollama CLI
                // wants the bare model name.
                let name = config
                    .refine_model
                    .strip_prefix("ollama/")
                    .unwrap_or(&config.refine_model);
                OllamaCli::new(
                    ModelId::new(name),
                    Duration::from_secs(config.refine_timeout_secs),
                )
            });
            let deps = SessionDeps {
                executor: &executor,
                validator: &validator,
                pressure: &pressure,
                refine_llm: refine_llm
                    .as_ref()
                    .map(|llm| llm as &dyn overnight::io::llm::LocalModel),
                search: None,
            };

            let verdict = run_session(&options, &config, &deps)?;
            Ok(verdict.exit_code())
        }
        Command::History { project } => {
            let store = RunStore::new(&project);
            let stats = HistoryLog::new(store.history_path()).query()?;
            print_history(&stats);
            Ok(exit_codes::OK)
        }
    }
}

fn overlay(
    config: &mut RunConfig,
    model: Option<String>,
    timeout: Option<u64>,
    lint_cmd: Option<String>,
    test_cmd: Option<String>,
    fix_retries: Option<u32>,
    max_failures: Option<u32>,
) {
    if let Some(model) = model {
        config.model = model;
    }
    if let Some(timeout) = timeout {
        config.task_timeout_secs = timeout;
    }
    if lint_cmd.is_some() {
        config.lint_cmd = lint_cmd;
    }
    if test_cmd.is_some() {
        config.test_cmd = test_cmd;
    }
    if let Some(fix_retries) = fix_retries {
        config.fix_retries = fix_retries;
    }
    if let Some(max_failures) = max_failures {
        config.max_failures = max_failures;
    }
}

fn print_history(stats: &overnight::core::stats::AggregateStats) {
    if stats.overall.attempts == 0 {
        println!("no recorded outcomes");
        return;
    }
    println!(
        "overall: {}/{} succeeded ({:.0}%)",
        stats.overall.successes,
        stats.overall.attempts,
        stats.overall.rate() * 100.0
    );
    println!(
        "commits: {}, total duration: {}s",
        stats.total_commits, stats.total_duration_secs
    );
    for (category, tally) in &stats.by_category {
        println!(
            "  {category}: {}/{} ({:.0}%)",
            tally.successes,
            tally.attempts,
            tally.rate() * 100.0
        );
    }
    if stats.suggest_model_switch() {
        println!("hint: success rate is low; consider a more capable model");
    }
}
