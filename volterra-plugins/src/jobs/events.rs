//! Lifecycle events published by the scheduler

use super::job::{Job, JobFailure, JobId};
use serde::Serialize;

/// Capacity of the event channel; slow subscribers see `Lagged`
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A job lifecycle transition
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Queued { job: Job },
    Started { job: Job },
    Completed { job: Job },
    Failed { job: Job, error: JobFailure },
    Cancelled { job: Job },
    /// A worker task panicked; its job was failed and the slot freed
    WorkerRestarted { job_id: JobId, queue_type: String },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Queued { job }
            | JobEvent::Started { job }
            | JobEvent::Completed { job }
            | JobEvent::Failed { job, .. }
            | JobEvent::Cancelled { job } => job.id,
            JobEvent::WorkerRestarted { job_id, .. } => *job_id,
        }
    }

    /// Job snapshot carried by the event, if any
    pub fn job(&self) -> Option<&Job> {
        match self {
            JobEvent::Queued { job }
            | JobEvent::Started { job }
            | JobEvent::Completed { job }
            | JobEvent::Failed { job, .. }
            | JobEvent::Cancelled { job } => Some(job),
            JobEvent::WorkerRestarted { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Queued { .. } => "queued",
            JobEvent::Started { .. } => "started",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } => "failed",
            JobEvent::Cancelled { .. } => "cancelled",
            JobEvent::WorkerRestarted { .. } => "worker_restarted",
        }
    }
}
