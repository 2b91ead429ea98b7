//! Side-effecting adapters: processes, git, persistence, external tools.

pub mod checkpoint;
pub mod config;
pub mod executor;
pub mod git;
pub mod history;
pub mod interrupt;
pub mod llm;
pub mod monitor;
pub mod process;
pub mod prompt;
pub mod run_store;
pub mod tasks;
pub mod validation;
