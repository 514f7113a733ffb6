//! Volterra plugins CLI library
//!
//! Command-line definitions, subcommands and exit codes of the
//! `volterra-plugins` binary.

/// Command-line interface definitions and argument parsing
pub mod cli;
/// Subcommand implementations
pub mod commands;
/// Error type carrying an exit code
pub mod error;
/// Exit codes used by the CLI application
pub mod exit_codes;
/// Logging setup
pub mod logging;
