//! Job execution metrics collection
//!
//! [`MetricsCollector`] is a passive observer: it only reads the scheduler's
//! event stream and load snapshots. A periodic health check updates the peak
//! memory mark and warns about running jobs that are close to their timeout.
//! Stopping those jobs is left to the scheduler's watchdog.

use crate::jobs::{JobEvent, JobId, JobScheduler, LoadSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default share of a job's timeout after which a warning is emitted
pub const DEFAULT_TIMEOUT_WARNING_RATIO: f64 = 0.9;

/// Point-in-time copy of the collected metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Jobs that completed or failed
    pub total_jobs_processed: u64,
    /// Jobs that failed, including timeouts
    pub total_jobs_failed: u64,
    /// Jobs cancelled by a caller or by shutdown
    pub total_jobs_cancelled: u64,
    /// Mean wall time of processed jobs
    pub average_processing_time_ms: f64,
    /// Highest process memory seen by a health check
    pub peak_memory_usage_mb: f64,
    /// Worker tasks that panicked
    pub worker_restarts: u64,
    /// Warnings about jobs nearing their timeout
    pub timeout_warnings: u64,
    /// Jobs currently running
    pub running_jobs: usize,
}

#[derive(Debug)]
struct RunningJob {
    started_at: DateTime<Utc>,
    timeout_ms: Option<u64>,
    warned: bool,
}

#[derive(Debug, Default)]
struct MetricsState {
    totals: MetricsSnapshot,
    timed_samples: u64,
    running: HashMap<JobId, RunningJob>,
}

impl MetricsState {
    fn record_processing_time(&mut self, millis: f64) {
        self.timed_samples += 1;
        let n = self.timed_samples as f64;
        let average = &mut self.totals.average_processing_time_ms;
        *average = (*average * (n - 1.0) + millis) / n;
    }
}

/// Collects counters and timings from job lifecycle events
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    state: Arc<Mutex<MetricsState>>,
    warning_ratio: f64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_WARNING_RATIO)
    }
}

impl MetricsCollector {
    /// Create a collector warning at `warning_ratio` of a job's timeout
    pub fn new(warning_ratio: f64) -> Self {
        Self {
            state: Arc::default(),
            warning_ratio,
        }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fold one lifecycle event into the metrics
    pub fn record(&self, event: &JobEvent) {
        let mut state = self.state();
        match event {
            JobEvent::Queued { .. } => {}
            JobEvent::Started { job } => {
                state.running.insert(
                    job.id,
                    RunningJob {
                        started_at: job.started_at.unwrap_or_else(Utc::now),
                        timeout_ms: job.timeout_ms(),
                        warned: false,
                    },
                );
            }
            JobEvent::Completed { job } | JobEvent::Failed { job, .. } => {
                state.running.remove(&job.id);
                state.totals.total_jobs_processed += 1;
                if matches!(event, JobEvent::Failed { .. }) {
                    state.totals.total_jobs_failed += 1;
                }
                if let Some(elapsed) = job.processing_time() {
                    state.record_processing_time(elapsed.num_milliseconds().max(0) as f64);
                }
            }
            JobEvent::Cancelled { job } => {
                state.running.remove(&job.id);
                state.totals.total_jobs_cancelled += 1;
            }
            JobEvent::WorkerRestarted { job_id, queue_type } => {
                tracing::warn!("Worker restarted on queue '{}' after job {}", queue_type, job_id);
                state.running.remove(job_id);
                state.totals.worker_restarts += 1;
            }
        }
        let running = state.running.len();
        state.totals.running_jobs = running;
    }

    /// Run one health check against the current time
    ///
    /// Returns the jobs warned about by this check.
    pub fn health_check(&self, load: &LoadSnapshot) -> Vec<JobId> {
        self.health_check_at(load, Utc::now())
    }

    /// Run one health check as of `now`
    pub fn health_check_at(&self, load: &LoadSnapshot, now: DateTime<Utc>) -> Vec<JobId> {
        let mut state = self.state();
        if load.process_memory_mb > state.totals.peak_memory_usage_mb {
            state.totals.peak_memory_usage_mb = load.process_memory_mb;
        }

        let mut warned = Vec::new();
        for (id, job) in state.running.iter_mut() {
            let Some(timeout_ms) = job.timeout_ms else {
                continue;
            };
            if job.warned {
                continue;
            }
            let elapsed_ms = (now - job.started_at).num_milliseconds().max(0) as f64;
            if elapsed_ms > timeout_ms as f64 * self.warning_ratio {
                tracing::warn!(
                    "Job {} has been running for {:.0}ms, {:.0}% of its {}ms timeout",
                    id,
                    elapsed_ms,
                    elapsed_ms / timeout_ms as f64 * 100.0,
                    timeout_ms
                );
                job.warned = true;
                warned.push(*id);
            }
        }
        state.totals.timeout_warnings += warned.len() as u64;

        tracing::debug!(
            "Health check: {} running, cpu {:.1}%, ram {:.1}%, memory {:.1}MB",
            state.running.len(),
            load.cpu_percent,
            load.ram_percent,
            load.process_memory_mb
        );
        warned
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state().totals.clone()
    }

    /// Follow `events` and run a health check every `interval`
    pub fn start(
        &self,
        mut events: broadcast::Receiver<JobEvent>,
        load: watch::Receiver<LoadSnapshot>,
        interval: Duration,
    ) -> MetricsHandle {
        let shutdown = CancellationToken::new();

        let collector = self.clone();
        let stop = shutdown.clone();
        let event_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => collector.record(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Metrics collector missed {} job events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        let collector = self.clone();
        let stop = shutdown.clone();
        let health_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = *load.borrow();
                        collector.health_check(&snapshot);
                    }
                }
            }
        });

        MetricsHandle {
            shutdown,
            tasks: vec![event_task, health_task],
        }
    }

    /// Start a collector on a scheduler's events and load, using its config
    pub fn attach(scheduler: &JobScheduler) -> (Self, MetricsHandle) {
        let config = scheduler.config();
        let collector = Self::new(config.timeout_warning_ratio);
        let handle = collector.start(
            scheduler.subscribe(),
            scheduler.load_receiver(),
            config.health_check_interval,
        );
        (collector, handle)
    }
}

/// Background tasks of a started [`MetricsCollector`]
#[derive(Debug)]
pub struct MetricsHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MetricsHandle {
    /// Stop the event and health-check loops
    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
