//! Persistence handoff for job results and status changes

use super::job::{Job, JobId, JobResult, JobStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Errors reported by a result sink
#[derive(Debug, Error)]
pub enum SinkError {
    /// The backing store rejected the write
    #[error("Result sink storage error: {0}")]
    Storage(String),

    /// The result could not be serialized for storage
    #[error("Result sink serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Receives completed results and every status transition
///
/// Failures are logged by the scheduler; they never change a job's outcome.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Store the aggregated output of a completed job
    async fn store_result(&self, result: &JobResult) -> Result<(), SinkError>;

    /// Record a job's new status
    async fn update_status(&self, job: &Job) -> Result<(), SinkError>;
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResultSink;

#[async_trait]
impl ResultSink for NullResultSink {
    async fn store_result(&self, _result: &JobResult) -> Result<(), SinkError> {
        Ok(())
    }

    async fn update_status(&self, _job: &Job) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps results and status history in memory
#[derive(Debug, Default)]
pub struct MemoryResultSink {
    results: DashMap<JobId, JobResult>,
    history: DashMap<JobId, Vec<JobStatus>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result(&self, job_id: &JobId) -> Option<JobResult> {
        self.results.get(job_id).map(|r| r.clone())
    }

    /// Statuses recorded for a job, oldest first
    pub fn status_history(&self, job_id: &JobId) -> Vec<JobStatus> {
        self.history
            .get(job_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn store_result(&self, result: &JobResult) -> Result<(), SinkError> {
        self.results.insert(result.job_id, result.clone());
        Ok(())
    }

    async fn update_status(&self, job: &Job) -> Result<(), SinkError> {
        self.history.entry(job.id).or_default().push(job.status);
        Ok(())
    }
}
