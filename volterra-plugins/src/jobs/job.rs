//! Job records and their lifecycle

use crate::invocation::{CompiledInvocation, TrajectoryFrame};
use crate::process::ExecutionError;
use crate::stream::ProgressSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Unique identifier of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Ulid);

impl JobId {
    /// Create a new random job ID
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a JobId from its string form
    pub fn parse(s: &str) -> Result<Self, String> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| format!("Invalid job ID '{}': {}", s, e))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identifier shared by the jobs of one batch submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Ulid);

impl BatchId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker slot and acceptable system load
    Queued,
    /// The plugin process is running
    Running,
    /// The process exited successfully and its output was aggregated
    Completed,
    /// The job could not produce a result
    Failed,
    /// The job was cancelled by a caller
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is allowed
    ///
    /// Statuses only move forward; Cancelled is reachable from Queued and
    /// Running, Completed and Failed only from Running.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reason a job failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The invocation could not be composed from the workflow
    InvalidInvocation,
    /// The plugin binary is missing or not executable
    BinaryNotAccessible,
    /// The OS refused to start the plugin
    SpawnFailed,
    /// The plugin exited with a nonzero code or was killed externally
    ProcessExitedNonZero,
    /// The watchdog stopped the job after its timeout
    TimeoutExceeded,
    /// The plugin's output stream could not be decoded
    StreamDecode,
    /// The worker running the job panicked or lost its process
    WorkerCrashed,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::InvalidInvocation => "invalid_invocation",
            FailureReason::BinaryNotAccessible => "binary_not_accessible",
            FailureReason::SpawnFailed => "spawn_failed",
            FailureReason::ProcessExitedNonZero => "process_exited_non_zero",
            FailureReason::TimeoutExceeded => "timeout_exceeded",
            FailureReason::StreamDecode => "stream_decode",
            FailureReason::WorkerCrashed => "worker_crashed",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ExecutionError> for FailureReason {
    fn from(error: &ExecutionError) -> Self {
        match error {
            ExecutionError::BinaryNotAccessible { .. } => FailureReason::BinaryNotAccessible,
            ExecutionError::SpawnFailed { .. } => FailureReason::SpawnFailed,
            ExecutionError::ProcessExitedNonZero { .. } | ExecutionError::Terminated { .. } => {
                FailureReason::ProcessExitedNonZero
            }
            ExecutionError::Io(_) => FailureReason::WorkerCrashed,
        }
    }
}

/// Why a job failed, as exposed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub message: String,
    /// Last lines the plugin wrote to stderr
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr_tail: String,
}

impl JobFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            stderr_tail: String::new(),
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr_tail = stderr.into();
        self
    }
}

impl From<&ExecutionError> for JobFailure {
    fn from(error: &ExecutionError) -> Self {
        JobFailure::new(error.into(), error.to_string())
            .with_stderr(error.stderr().unwrap_or_default())
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// What a job runs and against which frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Modifier name of the workflow
    pub plugin: String,
    pub frame: TrajectoryFrame,
    /// Runtime argument values
    #[serde(default)]
    pub values: HashMap<String, Value>,
    /// Composed when the job is dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation: Option<CompiledInvocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    /// Failed job this one re-runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<JobId>,
}

/// Snapshot of a job handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_type: String,
    pub status: JobStatus,
    pub metadata: JobMetadata,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    #[serde(default)]
    pub progress: ProgressSnapshot,
    /// Item count of the aggregated result, once completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_count: Option<u64>,
}

impl Job {
    pub(crate) fn new(queue_type: impl Into<String>, metadata: JobMetadata) -> Self {
        Self {
            id: JobId::new(),
            queue_type: queue_type.into(),
            status: JobStatus::Queued,
            metadata,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure: None,
            progress: ProgressSnapshot::default(),
            result_count: None,
        }
    }

    /// Wall time between start and finish
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    /// Effective timeout of the composed invocation
    pub fn timeout_ms(&self) -> Option<u64> {
        self.metadata.invocation.as_ref()?.timeout_ms
    }
}

/// Aggregated output of a completed job, handed to the result sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<String>,
    pub data: Value,
    pub metadata: Value,
    pub count: u64,
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub status: JobStatus,
    pub progress: ProgressSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_status_transitions_only_move_forward() {
        use JobStatus::*;
        let all = [Queued, Running, Completed, Failed, Cancelled];

        for from in all {
            for to in all {
                let allowed = from.can_transition_to(to);
                if from.is_terminal() {
                    assert!(!allowed, "{from} -> {to} allowed from a terminal state");
                }
                if to == Queued {
                    assert!(!allowed, "{from} -> queued allowed");
                }
            }
        }
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
    }

    #[test]
    fn test_failure_reason_codes() {
        assert_eq!(FailureReason::TimeoutExceeded.as_str(), "timeout_exceeded");
        assert_eq!(
            serde_json::to_value(FailureReason::ProcessExitedNonZero).unwrap(),
            "process_exited_non_zero"
        );
        assert_eq!(
            serde_json::from_str::<FailureReason>("\"worker_crashed\"").unwrap(),
            FailureReason::WorkerCrashed
        );
    }

    #[test]
    fn test_failure_from_execution_error_keeps_stderr() {
        let error = ExecutionError::ProcessExitedNonZero {
            code: 2,
            stderr: "bad frame".to_string(),
        };
        let failure = JobFailure::from(&error);
        assert_eq!(failure.reason, FailureReason::ProcessExitedNonZero);
        assert_eq!(failure.stderr_tail, "bad frame");

        let missing = ExecutionError::BinaryNotAccessible {
            path: PathBuf::from("/nope"),
            reason: "missing".to_string(),
        };
        assert_eq!(
            JobFailure::from(&missing).reason,
            FailureReason::BinaryNotAccessible
        );
    }

    #[test]
    fn test_job_id_parse_round_trips_display() {
        let id = JobId::new();
        assert_eq!(JobId::parse(&id.to_string()).unwrap(), id);
        assert!(JobId::parse("not-a-ulid").is_err());
    }

    #[test]
    fn test_job_serializes_snake_case_status() {
        let job = Job::new(
            "analysis",
            JobMetadata {
                plugin: "demo".to_string(),
                frame: TrajectoryFrame::new("traj"),
                values: HashMap::new(),
                invocation: None,
                batch_id: None,
                retry_of: None,
            },
        );
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "queued");
        assert_eq!(value["metadata"]["frame"]["trajectory_id"], "traj");
        assert!(value.get("failure").is_none());
    }
}
