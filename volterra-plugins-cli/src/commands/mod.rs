//! Subcommand implementations

pub mod compile;
pub mod run;
pub mod validate;

use crate::cli::FrameArgs;
use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use volterra_plugins::{TrajectoryFrame, Workflow};

pub(crate) fn load_workflow(path: &Path) -> volterra_plugins::Result<Workflow> {
    let workflow = Workflow::load(path)?;
    tracing::debug!(
        "Loaded workflow {} with {} nodes",
        path.display(),
        workflow.nodes.len()
    );
    Ok(workflow)
}

impl FrameArgs {
    pub(crate) fn frame(&self) -> TrajectoryFrame {
        let mut frame = TrajectoryFrame::new(&self.trajectory);
        if let Some(timestep) = self.timestep {
            frame = frame.with_timestep(timestep);
        }
        if let Some(input) = &self.input {
            frame = frame.with_input(input);
        }
        frame
    }

    /// Runtime values; a repeated key keeps its last value
    pub(crate) fn value_map(&self) -> HashMap<String, Value> {
        self.values.iter().cloned().collect()
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}
