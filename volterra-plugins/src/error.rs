//! Crate-wide error type
//!
//! Each module reports its own typed error. [`PluginError`] wraps all of
//! them so that callers driving the whole pipeline can use a single
//! `Result` and still tell which stage failed. [`ErrorContext`] layers a
//! message over any of them without losing the stage, and [`ErrorChain`]
//! renders an error with its causes for log lines.

use crate::config::ConfigError;
use crate::invocation::{ArgumentBuildError, InvocationError, TemplateError};
use crate::jobs::{SchedulerError, SinkError};
use crate::process::ExecutionError;
use crate::stream::StreamDecodeError;
use crate::workflow::{GraphError, ValidationError, WorkflowLoadError};
use std::fmt;
use std::io;
use thiserror::Error;

/// Any error produced by the plugin pipeline
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A workflow file could not be read or parsed
    #[error(transparent)]
    WorkflowLoad(#[from] WorkflowLoadError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The workflow is not executable
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Arguments(#[from] ArgumentBuildError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// The plugin process could not be run or did not succeed
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// The plugin's output stream was malformed
    #[error(transparent)]
    StreamDecode(#[from] StreamDecodeError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A pipeline error with a message describing what was being attempted
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: Box<PluginError>,
    },
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PluginError>;

/// Pipeline stage an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorStage {
    /// Reading files or (de)serializing documents
    Input,
    /// Configuration loading and validation
    Configuration,
    /// The workflow graph itself
    Workflow,
    /// Composing the command line
    Invocation,
    /// Running the plugin and reading its output
    Execution,
    /// Queueing, lookups and result handoff
    Scheduling,
}

impl ErrorStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorStage::Input => "input",
            ErrorStage::Configuration => "configuration",
            ErrorStage::Workflow => "workflow",
            ErrorStage::Invocation => "invocation",
            ErrorStage::Execution => "execution",
            ErrorStage::Scheduling => "scheduling",
        }
    }

    /// Whether the error comes from the environment rather than from the
    /// workflow or job being processed
    pub fn is_environmental(self) -> bool {
        matches!(self, ErrorStage::Input | ErrorStage::Configuration)
    }
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PluginError {
    /// Stage the error belongs to; context messages keep their cause's stage
    pub fn stage(&self) -> ErrorStage {
        match self {
            PluginError::Context { source, .. } => source.stage(),
            PluginError::Io(_) | PluginError::WorkflowLoad(_) | PluginError::Json(_) => {
                ErrorStage::Input
            }
            PluginError::Config(_) => ErrorStage::Configuration,
            PluginError::Graph(_) | PluginError::Validation(_) => ErrorStage::Workflow,
            PluginError::Arguments(_) | PluginError::Template(_) | PluginError::Invocation(_) => {
                ErrorStage::Invocation
            }
            PluginError::Execution(_) | PluginError::StreamDecode(_) => ErrorStage::Execution,
            PluginError::Sink(_) => ErrorStage::Scheduling,
            PluginError::Scheduler(e) => match e {
                SchedulerError::Validation(_) => ErrorStage::Workflow,
                SchedulerError::Invocation(_) => ErrorStage::Invocation,
                SchedulerError::Config(_) => ErrorStage::Configuration,
                _ => ErrorStage::Scheduling,
            },
        }
    }
}

/// Attach a message to a failed result, converting it to [`PluginError`]
pub trait ErrorContext<T> {
    fn context<S: Into<String>>(self, message: S) -> Result<T>;

    /// Like [`context`](Self::context), building the message only on error
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<PluginError>,
{
    fn context<S: Into<String>>(self, message: S) -> Result<T> {
        self.with_context(|| message)
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| PluginError::Context {
            message: f().into(),
            source: Box::new(e.into()),
        })
    }
}

/// One-line rendering of an error and every cause below it
///
/// A cause whose message is already part of the message above it is skipped,
/// since many variants embed their source in their own text.
pub struct ErrorChain<'a>(&'a (dyn std::error::Error + 'a));

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut above = self.0.to_string();
        f.write_str(&above)?;

        let mut current = self.0.source();
        while let Some(cause) = current {
            let text = cause.to_string();
            if !above.contains(&text) {
                write!(f, ": {}", text)?;
            }
            above = text;
            current = cause.source();
        }
        Ok(())
    }
}

/// Access to [`ErrorChain`] on any error
pub trait ErrorChainExt {
    fn error_chain(&self) -> ErrorChain<'_>;
}

impl<E: std::error::Error> ErrorChainExt for E {
    fn error_chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}
