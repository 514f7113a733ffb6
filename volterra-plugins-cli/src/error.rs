//! Error handling for the CLI
//!
//! Commands return a [`CliError`] carrying the exit code to use, so the
//! source chain survives until it is printed. Pipeline errors pick their
//! exit code from the stage they failed in.

use crate::exit_codes::{EXIT_ERROR, EXIT_FAILURE};
use std::error::Error;
use std::fmt;
use volterra_plugins::PluginError;

/// Result type for CLI commands
pub type CliResult<T> = Result<T, CliError>;

/// Error with a suggested exit code
#[derive(Debug)]
pub struct CliError {
    pub message: String,
    pub exit_code: i32,
    pub source: Option<Box<dyn Error + Send + Sync>>,
}

impl CliError {
    /// Wrap an error, reporting it with `exit_code`
    pub fn from_error<E>(error: E, exit_code: i32) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let source = error.into();
        Self {
            message: source.to_string(),
            exit_code,
            source: Some(source),
        }
    }

    /// The message followed by every underlying cause
    pub fn full_chain(&self) -> String {
        let mut result = self.message.clone();
        let mut current = self.source.as_deref().and_then(|e| e.source());
        while let Some(err) = current {
            result.push_str(&format!("\n  Caused by: {}", err));
            current = err.source();
        }
        result
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for CliError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

impl From<PluginError> for CliError {
    fn from(error: PluginError) -> Self {
        let stage = error.stage();
        let exit_code = if stage.is_environmental() {
            EXIT_ERROR
        } else {
            EXIT_FAILURE
        };
        tracing::debug!("Command failed in the {} stage", stage);
        Self::from_error(error, exit_code)
    }
}

impl From<anyhow::Error> for CliError {
    fn from(error: anyhow::Error) -> Self {
        Self {
            message: format!("{:#}", error),
            exit_code: EXIT_ERROR,
            source: None,
        }
    }
}

/// Turn a command result into an exit code, printing errors to stderr
pub fn handle_cli_result(result: CliResult<i32>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e.full_chain());
            e.exit_code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use volterra_plugins::workflow::{ValidationError, WorkflowLoadError};

    #[test]
    fn test_anyhow_context_is_kept_in_message() {
        let err: anyhow::Result<()> = Err(std::io::Error::other("broken pipe"))
            .context("Failed to serialize output");
        let cli: CliError = err.unwrap_err().into();

        assert_eq!(cli.exit_code, EXIT_ERROR);
        assert!(cli.message.contains("Failed to serialize output"));
        assert!(cli.message.contains("broken pipe"));
    }

    #[test]
    fn test_invalid_workflow_exits_with_failure() {
        let cli: CliError = PluginError::from(ValidationError {
            errors: vec!["Workflow must contain an Entrypoint node".to_string()],
        })
        .into();

        assert_eq!(cli.exit_code, EXIT_FAILURE);
        assert_eq!(handle_cli_result(Err(cli)), EXIT_FAILURE);
    }

    #[test]
    fn test_unreadable_workflow_exits_with_error() {
        let cli: CliError = PluginError::from(WorkflowLoadError::Read {
            path: "workflow.json".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        })
        .into();

        assert_eq!(cli.exit_code, EXIT_ERROR);
        assert!(cli.full_chain().contains("workflow.json"));
        assert!(cli.full_chain().contains("denied"));
    }

    #[test]
    fn test_context_keeps_exit_code_of_cause() {
        use volterra_plugins::ErrorContext;

        let read: Result<(), WorkflowLoadError> = Err(WorkflowLoadError::Read {
            path: "workflow.json".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        });
        // anyhow::Context is also in scope here
        let cli: CliError = ErrorContext::context(read, "Failed to open plugin")
            .unwrap_err()
            .into();

        assert_eq!(cli.exit_code, EXIT_ERROR);
        assert_eq!(cli.message, "Failed to open plugin");
        assert!(cli.full_chain().contains("Caused by: "));
        assert!(cli.full_chain().contains("workflow.json"));
    }
}
