//! Stable exit codes for pilot CLI commands.

/// The turn completed, or the command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments or config, or an unreadable input file.
pub const INVALID: i32 = 1;
/// The retry budget was spent on consecutive failed attempts.
pub const RETRY_EXHAUSTED: i32 = 3;
/// The turn stopped early: provider or parse failure, cancellation, or the
/// round limit.
pub const FAILED: i32 = 4;
