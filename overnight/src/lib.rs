//! Unattended sequential code-task runner.
//!
//! Drives an external code-editing agent through a markdown task list,
//! one task at a time, for hours without supervision. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (routing, state transitions,
//!   outcome statistics). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (git, processes, the agent CLI,
//!   validation commands, persisted state). Behind traits so the session
//!   can be tested with scripted fakes.
//!
//! [`session`] coordinates core logic with I/O to implement the `run`
//! command; [`refine`] and [`report`] hang off it.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod refine;
pub mod report;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
