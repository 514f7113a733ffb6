//! Job scheduling and execution
//!
//! [`JobScheduler`] owns every job from submission to a terminal status.
//! Callers only ever receive [`Job`] snapshots; lifecycle changes are
//! published as [`JobEvent`]s and handed to a [`ResultSink`].

mod events;
mod job;
mod load;
mod scheduler;
mod sink;
mod worker;

#[cfg(test)]
mod scheduler_tests;

pub use events::{JobEvent, EVENT_CHANNEL_CAPACITY};
pub use job::{
    BatchId, FailureReason, Job, JobFailure, JobId, JobMetadata, JobResult, JobStatus,
    JobStatusReport,
};
pub use load::{spawn_load_monitor, LoadProbe, LoadSnapshot, StaticLoadProbe, SystemLoadProbe};
pub use scheduler::{
    Batch, BatchProgress, JobRequest, JobScheduler, SchedulerBuilder, SchedulerError,
    SchedulerResult,
};
pub use sink::{MemoryResultSink, NullResultSink, ResultSink, SinkError};
