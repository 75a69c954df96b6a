//! Stable exit codes for the overseer CLI.

/// Dry run succeeded or the mission ran to the end (blocked tasks included).
pub const OK: i32 = 0;
/// Mission or settings failed to load or validate, or another fatal error occurred.
pub const INVALID: i32 = 1;
/// The run was interrupted by the user; state was saved for resume.
pub const INTERRUPTED: i32 = 130;
