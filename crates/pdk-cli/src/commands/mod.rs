//! Command implementations.

pub mod artifacts;
pub mod run;
pub mod secrets;

/// Process exit codes: success, failure, interrupted.
pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = 130;
