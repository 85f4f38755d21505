//! Stable exit codes for loopgate CLI commands.

/// The session reached `done`, or a non-running command succeeded.
pub const OK: i32 = 0;
/// The session is blocked and needs a human.
pub const BLOCKED: i32 = 1;
/// Invalid input, missing or unplanned session, or any other fatal error.
pub const INVALID: i32 = 1;
/// `max_iterations` build iterations ran without the task finishing.
pub const MAX_ITERATIONS: i32 = 2;
/// The verification budget is spent.
pub const VERIFICATION_EXHAUSTED: i32 = 3;
/// The review budget is spent.
pub const REVIEW_EXHAUSTED: i32 = 4;
/// The operator interrupted the run (SIGINT/SIGTERM).
pub const INTERRUPTED: i32 = 130;
