use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "volterra-plugins")]
#[command(version)]
#[command(about = "Validate, compile and run trajectory analysis plugins")]
#[command(long_about = "
volterra-plugins works with plugin workflow documents: node graphs that
describe a plugin binary, its arguments and the results it exposes.

Example usage:
  volterra-plugins validate workflow.json
  volterra-plugins compile workflow.json --input dump.1000 --set cutoff=3.2
  volterra-plugins run workflow.json --input dump.1000 --timeout 600
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a workflow document
    #[command(long_about = "
Checks a workflow for required nodes, per-node rules, dangling edges and
cycles. The report is printed as JSON; the exit code is 0 when the
workflow is valid and 1 otherwise.
")]
    Validate {
        /// Path to the workflow JSON document
        workflow: PathBuf,
    },

    /// Print the command line a workflow compiles to for one frame
    Compile {
        /// Path to the workflow JSON document
        workflow: PathBuf,

        #[command(flatten)]
        frame: FrameArgs,

        /// Directory holding plugin binaries, by plugin name
        #[arg(long)]
        plugins_dir: Option<PathBuf>,

        /// Fail on invalid argument values instead of dropping them
        #[arg(long)]
        strict: bool,
    },

    /// Run a workflow against one frame and print the aggregated result
    Run {
        /// Path to the workflow JSON document
        workflow: PathBuf,

        #[command(flatten)]
        frame: FrameArgs,

        /// Job timeout in seconds, overriding the queue's
        #[arg(long)]
        timeout: Option<u64>,

        /// Scheduler configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory holding plugin binaries, by plugin name
        #[arg(long)]
        plugins_dir: Option<PathBuf>,
    },
}

/// Frame selection and runtime argument values
#[derive(clap::Args, Debug, Clone, Default)]
pub struct FrameArgs {
    /// Dump file of the frame
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Timestep of the frame
    #[arg(long)]
    pub timestep: Option<u64>,

    /// Owning trajectory ID
    #[arg(long, default_value = "local")]
    pub trajectory: String,

    /// Runtime argument value, as key=value (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub values: Vec<(String, Value)>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Parse `key=value`; the value is read as JSON when it parses, else as text
pub fn parse_key_value(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{}'", s));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
