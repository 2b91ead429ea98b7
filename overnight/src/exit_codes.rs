//! Stable exit codes for overnight CLI commands.

/// Every task succeeded.
pub const OK: i32 = 0;
/// Invalid usage, missing project/tasks file, or corrupt state.
pub const INVALID: i32 = 1;
/// Run finished but at least one task did not succeed.
pub const COMPLETED_WITH_FAILURES: i32 = 2;
/// Consecutive-failure limit reached; worktree rolled back.
pub const ABORTED: i32 = 3;
/// Interrupted by SIGINT; state saved for `--resume`.
pub const INTERRUPTED: i32 = 4;
