//! Stable exit codes for the `planrun run` command.

/// All executed tests passed.
pub const OK: i32 = 0;
/// At least one test failed or finished with a warning.
pub const FAIL: i32 = 1;
/// An error result is present, or no pass/fail/warn/error at all.
pub const ERROR: i32 = 2;
/// Execution produced no results whatsoever.
pub const NO_RESULTS: i32 = 3;
