//! Resource-aware job scheduling
//!
//! Every configured queue runs its own scheduling loop. A loop dispatches the
//! next queued job only when the queue has a free worker slot and the latest
//! [`LoadSnapshot`] is below both of the queue's thresholds; otherwise the
//! job stays queued and is re-evaluated on the next tick. A watchdog stops
//! running jobs that exceed their timeout.

use super::events::{JobEvent, EVENT_CHANNEL_CAPACITY};
use super::job::{
    BatchId, FailureReason, Job, JobFailure, JobId, JobMetadata, JobResult, JobStatus,
    JobStatusReport,
};
use super::load::{spawn_load_monitor, LoadProbe, LoadSnapshot, SystemLoadProbe};
use super::sink::{NullResultSink, ResultSink};
use super::worker::{JobControl, StopReason, Worker, WorkerOutcome};
use crate::config::{ConfigError, QueueConfig, SchedulerConfig};
use crate::error::ErrorChainExt;
use crate::invocation::{CompiledInvocation, InvocationBuilder, InvocationError, TrajectoryFrame};
use crate::process::{ProcessRunner, SpawnRetryPolicy};
use crate::workflow::{ValidationError, Workflow, WorkflowValidator};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors returned to callers of the scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The workflow failed validation; nothing was queued
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The invocation could not be composed
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// No queue of this type is configured
    #[error("Unknown queue type: {0}")]
    UnknownQueue(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// The scheduler is shutting down and accepts no new jobs
    #[error("Scheduler is shut down")]
    ShutDown,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A job submission
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub workflow: Arc<Workflow>,
    pub frame: TrajectoryFrame,
    pub values: HashMap<String, Value>,
    /// Queue to run on; the configured default queue when unset
    pub queue_type: Option<String>,
    /// Overrides the frame's timestep
    pub timestep: Option<u64>,
}

impl JobRequest {
    pub fn new(workflow: Arc<Workflow>, frame: TrajectoryFrame) -> Self {
        Self {
            workflow,
            frame,
            values: HashMap::new(),
            queue_type: None,
            timestep: None,
        }
    }

    pub fn with_values(mut self, values: HashMap<String, Value>) -> Self {
        self.values = values;
        self
    }

    pub fn with_queue(mut self, queue_type: impl Into<String>) -> Self {
        self.queue_type = Some(queue_type.into());
        self
    }

    pub fn with_timestep(mut self, timestep: u64) -> Self {
        self.timestep = Some(timestep);
        self
    }
}

/// Jobs submitted together for the frames of one trajectory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub id: BatchId,
    pub job_ids: Vec<JobId>,
}

/// Completion state of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    /// Jobs still queued or running
    pub remaining: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct JobRecord {
    job: Job,
    workflow: Arc<Workflow>,
    control: Arc<JobControl>,
    status_tx: watch::Sender<JobStatus>,
    /// Job created by `retry_failed` for this one
    retried_by: Option<JobId>,
}

struct QueueState {
    config: QueueConfig,
    pending: Mutex<VecDeque<JobId>>,
    notify: Notify,
    slots: Arc<Semaphore>,
}

impl QueueState {
    fn new(config: QueueConfig) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<JobId>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, id: JobId) {
        self.pending().push_back(id);
        self.notify.notify_one();
    }

    fn remove(&self, id: JobId) -> bool {
        let mut pending = self.pending();
        match pending.iter().position(|queued| *queued == id) {
            Some(index) => pending.remove(index).is_some(),
            None => false,
        }
    }
}

struct Inner {
    config: SchedulerConfig,
    queues: HashMap<String, Arc<QueueState>>,
    jobs: DashMap<JobId, JobRecord>,
    batches: DashMap<BatchId, Vec<JobId>>,
    events: broadcast::Sender<JobEvent>,
    sink: Arc<dyn ResultSink>,
    load: watch::Receiver<LoadSnapshot>,
    worker: Worker,
    builder: InvocationBuilder,
    validator: WorkflowValidator,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Configures and starts a [`JobScheduler`]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    probe: Option<Box<dyn LoadProbe>>,
    sink: Option<Arc<dyn ResultSink>>,
    output_dir: Option<PathBuf>,
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            probe: None,
            sink: None,
            output_dir: None,
        }
    }

    /// Source of load samples; the host via `sysinfo` when unset
    pub fn with_load_probe(mut self, probe: impl LoadProbe) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    pub fn with_result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Directory plugins write per-frame output files into
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Validate the configuration and start the background loops
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> SchedulerResult<JobScheduler> {
        let config = self.config;
        config.validate()?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let probe: Box<dyn LoadProbe> = match self.probe {
            Some(probe) => probe,
            None => Box::new(SystemLoadProbe::new()),
        };
        let (load, monitor) =
            spawn_load_monitor(probe, config.load_sample_interval, shutdown.clone());
        tracker.spawn(async move {
            let _ = monitor.await;
        });

        let runner = ProcessRunner::new()
            .with_retry_policy(SpawnRetryPolicy::with_delay(config.spawn_retry_delay))
            .with_stderr_tail_lines(config.stderr_tail_lines)
            .with_termination_grace(config.termination_grace);
        let worker = Worker {
            runner,
            max_frame_bytes: config.max_frame_bytes,
            termination_grace: config.termination_grace,
        };

        let mut builder = InvocationBuilder::new(&config.plugins_dir);
        if let Some(dir) = self.output_dir {
            builder = builder.with_output_dir(dir);
        }

        let queues = config
            .queues
            .iter()
            .map(|q| (q.queue_type.clone(), Arc::new(QueueState::new(q.clone()))))
            .collect::<HashMap<_, _>>();

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            queues,
            jobs: DashMap::new(),
            batches: DashMap::new(),
            events,
            sink: self.sink.unwrap_or_else(|| Arc::new(NullResultSink) as Arc<dyn ResultSink>),
            load,
            worker,
            builder,
            validator: WorkflowValidator::new(),
            shutdown,
            tracker,
            config,
        });

        for queue in inner.queues.values() {
            tracing::debug!(
                "Starting queue '{}' with {} slots (cpu < {}%, ram < {}%)",
                queue.config.queue_type,
                queue.config.max_concurrent_jobs,
                queue.config.cpu_load_threshold,
                queue.config.ram_load_threshold
            );
            inner
                .tracker
                .spawn(run_queue(inner.clone(), queue.clone()));
        }
        inner.tracker.spawn(run_watchdog(inner.clone()));

        Ok(JobScheduler { inner })
    }
}

/// Queues, admits and supervises plugin jobs
///
/// Dropping the scheduler stops its loops; call [`JobScheduler::shutdown`]
/// to also wait for running jobs to wind down.
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    /// Start a scheduler with the host load probe and no result sink
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        SchedulerBuilder::new(config).start()
    }

    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Validate the workflow and queue one job on the default queue
    pub async fn submit(
        &self,
        workflow: Arc<Workflow>,
        frame: TrajectoryFrame,
        values: HashMap<String, Value>,
    ) -> SchedulerResult<JobId> {
        self.submit_request(JobRequest::new(workflow, frame).with_values(values))
            .await
    }

    pub async fn submit_request(&self, request: JobRequest) -> SchedulerResult<JobId> {
        self.inner.validator.ensure_valid(&request.workflow)?;
        self.inner.submit_validated(request, None).await
    }

    /// Queue one job per frame, validating the workflow once
    pub async fn submit_batch(
        &self,
        workflow: Arc<Workflow>,
        frames: Vec<TrajectoryFrame>,
        values: HashMap<String, Value>,
    ) -> SchedulerResult<Batch> {
        self.inner.validator.ensure_valid(&workflow)?;

        let id = BatchId::new();
        self.inner.batches.insert(id, Vec::with_capacity(frames.len()));

        let mut job_ids = Vec::with_capacity(frames.len());
        for frame in frames {
            let request = JobRequest::new(workflow.clone(), frame).with_values(values.clone());
            job_ids.push(self.inner.submit_validated(request, Some(id)).await?);
        }

        tracing::info!("Submitted batch {} with {} jobs", id, job_ids.len());
        Ok(Batch { id, job_ids })
    }

    pub fn batch_progress(&self, id: BatchId) -> SchedulerResult<BatchProgress> {
        let job_ids = self
            .inner
            .batches
            .get(&id)
            .map(|ids| ids.clone())
            .ok_or(SchedulerError::BatchNotFound(id))?;

        let mut progress = BatchProgress {
            total: job_ids.len(),
            ..Default::default()
        };
        for job_id in job_ids {
            match self.inner.jobs.get(&job_id).map(|r| r.job.status) {
                Some(JobStatus::Completed) => progress.completed += 1,
                Some(JobStatus::Failed) => progress.failed += 1,
                Some(JobStatus::Cancelled) => progress.cancelled += 1,
                Some(JobStatus::Queued | JobStatus::Running) => progress.remaining += 1,
                None => {}
            }
        }
        Ok(progress)
    }

    /// Status, live progress and failure of a job
    pub fn status(&self, id: JobId) -> SchedulerResult<JobStatusReport> {
        let record = self
            .inner
            .jobs
            .get(&id)
            .ok_or(SchedulerError::JobNotFound(id))?;
        Ok(JobStatusReport {
            status: record.job.status,
            progress: record.control.progress.snapshot(),
            error: record.job.failure.clone(),
        })
    }

    /// Immutable snapshot of a job
    pub fn snapshot(&self, id: JobId) -> SchedulerResult<Job> {
        self.inner
            .snapshot(id)
            .ok_or(SchedulerError::JobNotFound(id))
    }

    /// Snapshots of every known job, oldest first
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs = self
            .inner
            .jobs
            .iter()
            .map(|r| {
                let mut job = r.job.clone();
                job.progress = r.control.progress.snapshot();
                job
            })
            .collect::<Vec<_>>();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    /// Resolve once the job reaches a terminal status
    pub async fn wait(&self, id: JobId) -> SchedulerResult<Job> {
        let mut status = self
            .inner
            .jobs
            .get(&id)
            .map(|r| r.status_tx.subscribe())
            .ok_or(SchedulerError::JobNotFound(id))?;

        // The sender lives in the job record, which is never removed
        let _ = status.wait_for(|s| s.is_terminal()).await;
        self.snapshot(id)
    }

    /// Receive every lifecycle event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Latest load sample used for admission
    pub fn load_receiver(&self) -> watch::Receiver<LoadSnapshot> {
        self.inner.load.clone()
    }

    /// Cancel a queued or running job
    ///
    /// Returns false when the job already finished.
    pub async fn cancel(&self, id: JobId) -> SchedulerResult<bool> {
        let (status, queue_type, control) = {
            let record = self
                .inner
                .jobs
                .get(&id)
                .ok_or(SchedulerError::JobNotFound(id))?;
            (
                record.job.status,
                record.job.queue_type.clone(),
                record.control.clone(),
            )
        };

        if status == JobStatus::Queued {
            if let Some(queue) = self.inner.queues.get(&queue_type) {
                queue.remove(id);
            }
            if let Some(job) = self.inner.cancel_queued(id) {
                tracing::info!("Cancelled queued job {}", id);
                self.inner.announce(JobEvent::Cancelled { job }).await;
                return Ok(true);
            }
        }

        // Either running, or dispatched while we were removing it
        let running = self
            .inner
            .jobs
            .get(&id)
            .is_some_and(|r| r.job.status == JobStatus::Running);
        if running && control.stop(StopReason::Cancel) {
            tracing::info!("Cancelling running job {}", id);
            return Ok(true);
        }
        Ok(false)
    }

    /// Re-queue every failed job of a trajectory as a new job
    ///
    /// Failed jobs stay as they are; each is retried at most once, so calling
    /// this again only picks up jobs that failed since.
    pub async fn retry_failed(&self, trajectory_id: &str) -> SchedulerResult<usize> {
        let candidates = self
            .inner
            .jobs
            .iter()
            .filter(|r| {
                r.job.status == JobStatus::Failed
                    && r.retried_by.is_none()
                    && r.job.metadata.frame.trajectory_id == trajectory_id
            })
            .map(|r| *r.key())
            .collect::<Vec<_>>();

        let mut retried = 0;
        for failed_id in candidates {
            let (job, workflow) = {
                let Some(mut record) = self.inner.jobs.get_mut(&failed_id) else {
                    continue;
                };
                if record.retried_by.is_some() {
                    continue;
                }
                let metadata = JobMetadata {
                    invocation: None,
                    retry_of: Some(failed_id),
                    ..record.job.metadata.clone()
                };
                let job = Job::new(record.job.queue_type.clone(), metadata);
                record.retried_by = Some(job.id);
                (job, record.workflow.clone())
            };

            tracing::info!("Retrying failed job {} as {}", failed_id, job.id);
            self.inner.enqueue(job, workflow).await?;
            retried += 1;
        }
        Ok(retried)
    }

    /// Stop the loops, cancel every unfinished job and wait for workers
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() && self.inner.tracker.is_closed() {
            self.inner.tracker.wait().await;
            return;
        }
        tracing::info!("Shutting down job scheduler");
        self.inner.shutdown.cancel();

        let unfinished = self
            .inner
            .jobs
            .iter()
            .filter(|r| !r.job.status.is_terminal())
            .map(|r| (*r.key(), r.job.queue_type.clone(), r.control.clone()))
            .collect::<Vec<_>>();

        for (id, queue_type, control) in unfinished {
            if let Some(queue) = self.inner.queues.get(&queue_type) {
                queue.remove(id);
            }
            match self.inner.cancel_queued(id) {
                Some(job) => self.inner.announce(JobEvent::Cancelled { job }).await,
                None => {
                    control.stop(StopReason::Shutdown);
                }
            }
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("Job scheduler stopped");
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    async fn submit_validated(
        &self,
        request: JobRequest,
        batch_id: Option<BatchId>,
    ) -> SchedulerResult<JobId> {
        let queue_type = request
            .queue_type
            .unwrap_or_else(|| self.config.default_queue.clone());

        let mut frame = request.frame;
        if let Some(timestep) = request.timestep {
            frame.timestep = Some(timestep);
        }

        let plugin = request
            .workflow
            .modifier()
            .map(|m| m.name.clone())
            .unwrap_or_default();
        let metadata = JobMetadata {
            plugin,
            frame,
            values: request.values,
            invocation: None,
            batch_id,
            retry_of: None,
        };

        self.enqueue(Job::new(queue_type, metadata), request.workflow)
            .await
    }

    async fn enqueue(&self, job: Job, workflow: Arc<Workflow>) -> SchedulerResult<JobId> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        let queue = self
            .queues
            .get(&job.queue_type)
            .ok_or_else(|| SchedulerError::UnknownQueue(job.queue_type.clone()))?
            .clone();

        let id = job.id;
        if let Some(batch_id) = job.metadata.batch_id {
            if let Some(mut batch) = self.batches.get_mut(&batch_id) {
                batch.push(id);
            }
        }

        let (status_tx, _) = watch::channel(JobStatus::Queued);
        self.jobs.insert(
            id,
            JobRecord {
                job: job.clone(),
                workflow,
                control: Arc::new(JobControl::default()),
                status_tx,
                retried_by: None,
            },
        );
        tracing::info!(
            "Queued job {} ({} on trajectory {}) in '{}'",
            id,
            job.metadata.plugin,
            job.metadata.frame.trajectory_id,
            job.queue_type
        );

        self.announce(JobEvent::Queued { job }).await;
        queue.push(id);
        Ok(id)
    }

    fn snapshot(&self, id: JobId) -> Option<Job> {
        self.jobs.get(&id).map(|r| {
            let mut job = r.job.clone();
            job.progress = r.control.progress.snapshot();
            job
        })
    }

    /// Move a job to `next` if the status machine allows it
    fn transition(
        &self,
        id: JobId,
        next: JobStatus,
        update: impl FnOnce(&mut Job),
    ) -> Option<Job> {
        self.transition_from(id, None, next, update)
    }

    /// Like `transition`, but only when the job is currently `from`
    fn transition_from(
        &self,
        id: JobId,
        from: Option<JobStatus>,
        next: JobStatus,
        update: impl FnOnce(&mut Job),
    ) -> Option<Job> {
        let mut record = self.jobs.get_mut(&id)?;
        let current = record.job.status;
        if from.is_some_and(|from| from != current) || !current.can_transition_to(next) {
            tracing::debug!("Ignoring transition of job {} from {} to {}", id, current, next);
            return None;
        }

        record.job.status = next;
        update(&mut record.job);
        record.job.progress = record.control.progress.snapshot();
        record.status_tx.send_replace(next);
        Some(record.job.clone())
    }

    fn cancel_queued(&self, id: JobId) -> Option<Job> {
        self.transition_from(id, Some(JobStatus::Queued), JobStatus::Cancelled, |job| {
            job.finished_at = Some(Utc::now());
        })
    }

    /// Hand the new status to the sink, then publish the event
    async fn announce(&self, event: JobEvent) {
        if let Some(job) = event.job() {
            if let Err(e) = self.sink.update_status(job).await {
                tracing::error!("Failed to record status of job {}: {}", job.id, e.error_chain());
            }
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn compile(
        &self,
        id: JobId,
        queue: &QueueConfig,
    ) -> Option<Result<CompiledInvocation, InvocationError>> {
        let (workflow, frame, values) = {
            let record = self.jobs.get(&id)?;
            (
                record.workflow.clone(),
                record.job.metadata.frame.clone(),
                record.job.metadata.values.clone(),
            )
        };
        let id = id.to_string();
        Some(
            self.builder
                .clone()
                .with_default_timeout(queue.timeout)
                .build(&workflow, &frame, &values, Some(&id)),
        )
    }

    /// Mark the job running and hand it to a worker holding `permit`
    fn dispatch(self: &Arc<Self>, id: JobId, queue: &QueueState, permit: OwnedSemaphorePermit) {
        let Some(invocation) = self.compile(id, &queue.config) else {
            return;
        };
        let Some(control) = self.jobs.get(&id).map(|r| r.control.clone()) else {
            return;
        };

        let Some(job) = self.transition(id, JobStatus::Running, |job| {
            job.started_at = Some(Utc::now());
            if let Ok(invocation) = &invocation {
                job.metadata.invocation = Some(invocation.clone());
            }
        }) else {
            return;
        };
        control.mark_started(invocation.as_ref().ok().and_then(|i| i.timeout()));

        let inner = self.clone();
        let worker = tokio::spawn(async move {
            match &invocation {
                Ok(invocation) => tracing::info!("Starting job {}: {}", id, invocation.command_line()),
                Err(e) => tracing::warn!("Job {} has no runnable invocation: {}", id, e.error_chain()),
            }
            inner.announce(JobEvent::Started { job }).await;

            let outcome = match invocation {
                Ok(invocation) => inner.worker.execute(&invocation, &control).await,
                Err(e) => WorkerOutcome::Failed(JobFailure::new(
                    FailureReason::InvalidInvocation,
                    e.error_chain().to_string(),
                )),
            };
            inner.finish(id, outcome).await;
        });

        let inner = self.clone();
        self.tracker.spawn(async move {
            let result = worker.await;
            if let Err(e) = result {
                if e.is_panic() {
                    inner.worker_crashed(id).await;
                }
            }
            drop(permit);
        });
    }

    async fn finish(&self, id: JobId, outcome: WorkerOutcome) {
        match outcome {
            WorkerOutcome::Completed(state) => {
                let exposure = self
                    .jobs
                    .get(&id)
                    .and_then(|r| r.job.metadata.invocation.as_ref()?.exposure.clone());
                let result = JobResult {
                    job_id: id,
                    exposure,
                    data: state.data,
                    metadata: state.metadata,
                    count: state.count,
                };
                if let Err(e) = self.sink.store_result(&result).await {
                    tracing::error!("Failed to store result of job {}: {}", id, e.error_chain());
                }

                if let Some(job) = self.transition(id, JobStatus::Completed, |job| {
                    job.finished_at = Some(Utc::now());
                    job.result_count = Some(result.count);
                }) {
                    tracing::info!(
                        "Job {} completed with {} items in {}ms",
                        id,
                        result.count,
                        job.processing_time()
                            .map(|t| t.num_milliseconds())
                            .unwrap_or_default()
                    );
                    self.announce(JobEvent::Completed { job }).await;
                }
            }
            WorkerOutcome::Failed(failure) => self.fail(id, failure).await,
            WorkerOutcome::Cancelled => {
                if let Some(job) = self.transition(id, JobStatus::Cancelled, |job| {
                    job.finished_at = Some(Utc::now());
                }) {
                    tracing::info!("Job {} cancelled", id);
                    self.announce(JobEvent::Cancelled { job }).await;
                }
            }
        }
    }

    async fn fail(&self, id: JobId, failure: JobFailure) {
        let recorded = failure.clone();
        if let Some(job) = self.transition(id, JobStatus::Failed, |job| {
            job.finished_at = Some(Utc::now());
            job.failure = Some(recorded);
        }) {
            tracing::warn!("Job {} failed: {}", id, failure);
            self.announce(JobEvent::Failed { job, error: failure }).await;
        }
    }

    async fn worker_crashed(&self, id: JobId) {
        let queue_type = self
            .jobs
            .get(&id)
            .map(|r| r.job.queue_type.clone())
            .unwrap_or_default();
        tracing::error!("Worker for job {} panicked, releasing its slot", id);

        self.fail(
            id,
            JobFailure::new(FailureReason::WorkerCrashed, "Worker task panicked"),
        )
        .await;
        let _ = self.events.send(JobEvent::WorkerRestarted {
            job_id: id,
            queue_type,
        });
    }

    /// Stop running jobs past their timeout; returns the ones stopped
    fn enforce_timeouts(&self) -> Vec<JobId> {
        let overdue = self
            .jobs
            .iter()
            .filter(|r| r.job.status == JobStatus::Running)
            .filter_map(|r| {
                let timeout = r.control.overdue()?;
                Some((*r.key(), r.control.clone(), timeout))
            })
            .collect::<Vec<_>>();

        let mut stopped = Vec::new();
        for (id, control, timeout) in overdue {
            if control.stop(StopReason::Timeout) {
                tracing::warn!("Job {} exceeded its timeout of {:?}, terminating", id, timeout);
                stopped.push(id);
            }
        }
        stopped
    }
}

async fn run_queue(inner: Arc<Inner>, queue: Arc<QueueState>) {
    let name = queue.config.queue_type.clone();
    let mut refusing = false;

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        if queue.pending().is_empty() {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = queue.notify.notified() => continue,
            }
        }

        let permit = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            permit = queue.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let load = *inner.load.borrow();
        if !load.admits(&queue.config) {
            drop(permit);
            if refusing {
                tracing::debug!(
                    "Queue '{}' still waiting on load: cpu {:.1}%, ram {:.1}%",
                    name,
                    load.cpu_percent,
                    load.ram_percent
                );
            } else {
                tracing::warn!(
                    "Queue '{}' holding jobs: cpu {:.1}% (limit {}%), ram {:.1}% (limit {}%)",
                    name,
                    load.cpu_percent,
                    queue.config.cpu_load_threshold,
                    load.ram_percent,
                    queue.config.ram_load_threshold
                );
                refusing = true;
            }
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(inner.config.tick_interval) => continue,
            }
        }
        if refusing {
            tracing::info!("Queue '{}' admitting jobs again", name);
            refusing = false;
        }

        let next = queue.pending().pop_front();
        if let Some(id) = next {
            inner.dispatch(id, &queue, permit);
        }
    }
    tracing::debug!("Queue '{}' loop stopped", name);
}

async fn run_watchdog(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.watchdog_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                inner.enforce_timeouts();
            }
        }
    }
    tracing::debug!("Watchdog stopped");
}
