use super::{load_workflow, print_json};
use crate::cli::FrameArgs;
use crate::error::CliResult;
use crate::exit_codes::{EXIT_FAILURE, EXIT_SUCCESS};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use volterra_plugins::{
    ErrorContext, Job, JobResult, JobScheduler, JobStatus, MemoryResultSink, MetricsCollector,
    MetricsSnapshot, SchedulerConfig,
};

#[derive(Serialize)]
struct RunOutput<'a> {
    job: &'a Job,
    result: Option<&'a JobResult>,
    metrics: MetricsSnapshot,
}

/// Schedule one job for a frame and wait for it to finish
pub async fn run_job(
    workflow: &Path,
    frame: &FrameArgs,
    timeout: Option<u64>,
    config_path: Option<PathBuf>,
    plugins_dir: Option<PathBuf>,
) -> CliResult<i32> {
    let workflow = Arc::new(load_workflow(workflow)?);
    let config = load_config(config_path.as_deref(), timeout, plugins_dir)?;

    let sink = Arc::new(MemoryResultSink::new());
    let scheduler = JobScheduler::builder(config)
        .with_result_sink(sink.clone())
        .start()
        .map_err(volterra_plugins::PluginError::from)?;
    let (metrics, metrics_handle) = MetricsCollector::attach(&scheduler);

    let outcome = wait_for_job(&scheduler, workflow, frame).await;
    scheduler.shutdown().await;
    metrics_handle.stop().await;
    let job = outcome?;

    if let Some(failure) = &job.failure {
        tracing::error!("Job {} failed: {}", job.id, failure.message);
    }
    let result = sink.result(&job.id);
    print_json(&RunOutput {
        job: &job,
        result: result.as_ref(),
        metrics: metrics.snapshot(),
    })?;

    Ok(if job.status == JobStatus::Completed {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}

fn load_config(
    path: Option<&Path>,
    timeout: Option<u64>,
    plugins_dir: Option<PathBuf>,
) -> volterra_plugins::Result<SchedulerConfig> {
    let mut config = match path {
        Some(path) => SchedulerConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => SchedulerConfig::load().context("Failed to load configuration")?,
    };
    if let Some(dir) = plugins_dir {
        config.plugins_dir = dir;
    }
    if let Some(secs) = timeout {
        let default_queue = config.default_queue.clone();
        for queue in config
            .queues
            .iter_mut()
            .filter(|q| q.queue_type == default_queue)
        {
            queue.timeout = Some(Duration::from_secs(secs));
        }
    }
    Ok(config)
}

/// Submit the job and wait for it; Ctrl-C cancels it
async fn wait_for_job(
    scheduler: &JobScheduler,
    workflow: Arc<volterra_plugins::Workflow>,
    frame: &FrameArgs,
) -> volterra_plugins::Result<Job> {
    let id = scheduler
        .submit(workflow, frame.frame(), frame.value_map())
        .await?;
    tracing::info!("Submitted job {}", id);

    let job = tokio::select! {
        job = scheduler.wait(id) => job?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling job {}", id);
            scheduler.cancel(id).await?;
            scheduler.wait(id).await?
        }
    };
    Ok(job)
}
