//! # Volterra Plugins
//!
//! Validation, compilation and supervised execution of trajectory analysis
//! plugins.
//!
//! ## Features
//!
//! - **Workflows**: Plugins are node graphs, validated before anything runs
//! - **Invocations**: Arguments and entrypoint templates compile to a command line
//! - **Processes**: Plugin binaries run under a supervisor with a narrow spawn retry
//! - **Streams**: MessagePack output is decoded and merged while the plugin runs
//! - **Scheduling**: Queues with worker slots, load-based admission and timeouts
//! - **Metrics**: A passive collector with a periodic health check
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use volterra_plugins::{JobScheduler, SchedulerConfig, TrajectoryFrame, Workflow};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let workflow = Arc::new(Workflow::load("plugins/cna/workflow.json")?);
//! let scheduler = JobScheduler::new(SchedulerConfig::load()?)?;
//!
//! let frame = TrajectoryFrame::new("trajectory-42")
//!     .with_timestep(1000)
//!     .with_input("dumps/dump.1000");
//! let job_id = scheduler.submit(workflow, frame, HashMap::new()).await?;
//!
//! let job = scheduler.wait(job_id).await?;
//! println!("{} finished as {}", job.id, job.status);
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```

/// Shared helpers: environment loading and JSON path lookup
pub mod common;

/// Layered scheduler configuration
pub mod config;

/// Crate-wide error type
pub mod error;

/// Argument compilation and invocation building
pub mod invocation;

/// Job scheduling, admission control and result handoff
pub mod jobs;

/// Passive job metrics and health checks
pub mod metrics;

/// Supervised plugin processes
pub mod process;

/// Decoding and aggregation of streamed plugin output
pub mod stream;

/// Plugin workflow graphs and validation
pub mod workflow;

#[cfg(test)]
mod test_utils;

pub use config::{QueueConfig, SchedulerConfig, YamlConfig};
pub use error::{ErrorChain, ErrorChainExt, ErrorContext, ErrorStage, PluginError, Result};
pub use invocation::{
    ArgumentCompiler, CompiledArguments, CompiledInvocation, InvocationBuilder, TrajectoryFrame,
};
pub use jobs::{
    Job, JobEvent, JobId, JobRequest, JobResult, JobScheduler, JobStatus, MemoryResultSink,
    ResultSink, SchedulerBuilder,
};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use process::{ExecutionError, ProcessRunner};
pub use stream::{ChunkAggregator, ChunkDecoder};
pub use workflow::{ValidationReport, Workflow, WorkflowGraphAnalyzer, WorkflowValidator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
