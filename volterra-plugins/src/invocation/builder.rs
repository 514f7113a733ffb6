//! Composition of a [`CompiledInvocation`] from a workflow and one frame

use super::arguments::{ArgumentBuildError, ArgumentCompiler, CompiledArguments};
use super::template::{render_arguments, TemplateError};
use crate::workflow::{NodeType, Workflow, WorkflowGraphAnalyzer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while composing an invocation
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The workflow lacks a node the invocation depends on
    #[error("Workflow has no {0} node")]
    MissingNode(NodeType),

    /// The entrypoint argument template could not be rendered
    #[error("Invalid entrypoint arguments: {0}")]
    Template(#[from] TemplateError),

    /// A strict compiler rejected an argument
    #[error(transparent)]
    Arguments(#[from] ArgumentBuildError),

    /// An argument is named after a key the template context reserves
    #[error("Argument '{0}' clashes with the reserved template key arguments.{0}")]
    ReservedArgument(String),
}

/// Keys under `arguments` in the template context that are not argument values
pub const RESERVED_ARGUMENT_NAMES: [&str; 3] = ["as_str", "as_array", "values"];

/// One frame of a trajectory to run a plugin against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryFrame {
    /// Owning trajectory
    pub trajectory_id: String,
    /// Simulation timestep of the frame, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestep: Option<u64>,
    /// Position of the frame within the trajectory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Dump file for this frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<PathBuf>,
}

impl TrajectoryFrame {
    pub fn new(trajectory_id: impl Into<String>) -> Self {
        Self {
            trajectory_id: trajectory_id.into(),
            ..Default::default()
        }
    }

    pub fn with_timestep(mut self, timestep: u64) -> Self {
        self.timestep = Some(timestep);
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_path = Some(path.into());
        self
    }

    /// Timestep, falling back to the frame index, then 0
    pub fn resolved_timestep(&self) -> u64 {
        self.timestep
            .or(self.index.map(|i| i as u64))
            .unwrap_or(0)
    }
}

/// A fully resolved command line for one execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledInvocation {
    pub binary_path: PathBuf,
    pub argv: Vec<String>,
    /// None means unbounded
    pub timeout_ms: Option<u64>,
    /// Dot-path projected out of every streamed message
    pub iterable_key: Option<String>,
    /// Exposure the streamed result belongs to
    pub exposure: Option<String>,
    /// Arguments as compiled, including any that were dropped
    pub arguments: CompiledArguments,
}

impl CompiledInvocation {
    /// Invocation of a binary with fixed argv, no timeout and no exposure
    pub fn new(binary_path: impl Into<PathBuf>, argv: Vec<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            argv,
            timeout_ms: None,
            iterable_key: None,
            exposure: None,
            arguments: CompiledArguments::default(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// `binary arg1 arg2 ...` for log lines
    pub fn command_line(&self) -> String {
        std::iter::once(self.binary_path.display().to_string())
            .chain(self.argv.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builds invocations for a workflow
#[derive(Debug, Clone)]
pub struct InvocationBuilder {
    plugins_dir: PathBuf,
    output_dir: PathBuf,
    default_timeout: Option<Duration>,
    compiler: ArgumentCompiler,
}

impl InvocationBuilder {
    /// Builder resolving relative binaries under `plugins_dir/<plugin name>/`
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            output_dir: std::env::temp_dir(),
            default_timeout: None,
            compiler: ArgumentCompiler::new(),
        }
    }

    /// Directory for `forEach.outputPath`
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Timeout used when the entrypoint declares none
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_compiler(mut self, compiler: ArgumentCompiler) -> Self {
        self.compiler = compiler;
        self
    }

    /// Compose the invocation for one frame
    pub fn build(
        &self,
        workflow: &Workflow,
        frame: &TrajectoryFrame,
        values: &HashMap<String, Value>,
        job_id: Option<&str>,
    ) -> Result<CompiledInvocation, InvocationError> {
        let modifier = workflow
            .modifier()
            .ok_or(InvocationError::MissingNode(NodeType::Modifier))?;
        let (entry_node, entrypoint) = workflow
            .entrypoint()
            .ok_or(InvocationError::MissingNode(NodeType::Entrypoint))?;

        let arguments = match workflow.arguments() {
            Some(data) => {
                if let Some(def) = data
                    .arguments
                    .iter()
                    .find(|def| RESERVED_ARGUMENT_NAMES.contains(&def.argument.as_str()))
                {
                    return Err(InvocationError::ReservedArgument(def.argument.clone()));
                }
                self.compiler.compile(&data.declarations(), values)?
            }
            None => CompiledArguments::default(),
        };

        let analyzer = WorkflowGraphAnalyzer::new(workflow);
        let exposure = analyzer
            .find_descendant_by_type(&entry_node.id, NodeType::Exposure)
            .and_then(|node| node.as_exposure())
            .or_else(|| workflow.exposures().next().map(|(_, data)| data));

        let timestep = frame.resolved_timestep();
        let output_path = self.output_dir.join(format!(
            "{}_{}_{}",
            frame.trajectory_id, timestep, modifier.name
        ));
        let current_value = match &frame.input_path {
            Some(path) => path.display().to_string(),
            None => timestep.to_string(),
        };

        let mut argument_values = serde_json::Map::new();
        for (key, value) in &arguments.resolved {
            argument_values.insert(key.clone(), Value::String(value.clone()));
        }
        let mut arguments_context = argument_values.clone();
        arguments_context.insert("as_str".to_string(), json!(arguments.argv));
        arguments_context.insert("as_array".to_string(), json!(arguments.argv));
        arguments_context.insert("values".to_string(), Value::Object(argument_values));

        let context = json!({
            "arguments": arguments_context,
            "trajectory": {
                "id": frame.trajectory_id,
                "timestep": timestep,
            },
            "forEach": {
                "currentValue": current_value,
                "currentIndex": frame.index.unwrap_or(0),
                "outputPath": output_path.display().to_string(),
                "timestep": timestep,
            },
            "modifier": {
                "name": modifier.name,
                "version": modifier.version,
            },
            "job": {
                "id": job_id.unwrap_or_default(),
            },
        });

        let argv = render_arguments(&entrypoint.arguments, &context)?;
        let timeout = entrypoint
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.default_timeout);

        Ok(CompiledInvocation {
            binary_path: self.resolve_binary(&modifier.name, &entrypoint.binary),
            argv,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
            iterable_key: exposure.and_then(|e| e.iterable.clone()),
            exposure: exposure.map(|e| e.name.clone()),
            arguments,
        })
    }

    fn resolve_binary(&self, plugin: &str, binary: &str) -> PathBuf {
        let path = Path::new(binary);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.plugins_dir.join(plugin).join(path)
        }
    }
}
