//! Exit codes of the CLI
//!
//! - 0: Success
//! - 1: The workflow is invalid or the job did not complete
//! - 2: The command could not run (unreadable input, bad configuration)

/// Successful execution
pub const EXIT_SUCCESS: i32 = 0;

/// Invalid workflow or unsuccessful job
pub const EXIT_FAILURE: i32 = 1;

/// The command itself could not run
pub const EXIT_ERROR: i32 = 2;
