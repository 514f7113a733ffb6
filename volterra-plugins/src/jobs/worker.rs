//! Execution of one job's plugin process

use super::job::{FailureReason, JobFailure};
use crate::error::ErrorChainExt;
use crate::invocation::CompiledInvocation;
use crate::process::ProcessRunner;
use crate::stream::{
    AggregationOptions, AggregationProgress, AggregationState, ChunkAggregator, ChunkDecoder,
    StreamDecodeError,
};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

/// Why a running job was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Timeout,
    Cancel,
    Shutdown,
}

/// Shared handle between a running job, the watchdog and cancel
#[derive(Debug, Default)]
pub(crate) struct JobControl {
    terminate: CancellationToken,
    reason: OnceLock<StopReason>,
    started: OnceLock<Instant>,
    timeout: OnceLock<Duration>,
    pub(crate) progress: Arc<AggregationProgress>,
}

impl JobControl {
    /// Request a stop; only the first request takes effect
    pub(crate) fn stop(&self, reason: StopReason) -> bool {
        if self.reason.set(reason).is_ok() {
            self.terminate.cancel();
            true
        } else {
            false
        }
    }

    pub(crate) fn stop_reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    pub(crate) fn mark_started(&self, timeout: Option<Duration>) {
        let _ = self.started.set(Instant::now());
        if let Some(timeout) = timeout {
            let _ = self.timeout.set(timeout);
        }
    }

    /// Configured timeout, once elapsed
    pub(crate) fn overdue(&self) -> Option<Duration> {
        let timeout = *self.timeout.get()?;
        (self.started.get()?.elapsed() > timeout).then_some(timeout)
    }
}

/// How a job's execution ended
#[derive(Debug)]
pub(crate) enum WorkerOutcome {
    Completed(AggregationState),
    Failed(JobFailure),
    Cancelled,
}

/// Settings a worker runs with
#[derive(Debug, Clone)]
pub(crate) struct Worker {
    pub(crate) runner: ProcessRunner,
    pub(crate) max_frame_bytes: usize,
    pub(crate) termination_grace: Duration,
}

impl Worker {
    /// Run the invocation, aggregating its stdout while it runs
    ///
    /// A stop request terminates the process once and keeps draining its
    /// output for the grace period so the aggregation ends between merges.
    pub(crate) async fn execute(
        &self,
        invocation: &CompiledInvocation,
        control: &JobControl,
    ) -> WorkerOutcome {
        if let Some(reason) = control.stop_reason() {
            return stopped_outcome(reason, None, String::new());
        }

        let mut process = match self
            .runner
            .spawn(&invocation.binary_path, &invocation.argv)
            .await
        {
            Ok(process) => process,
            Err(error) => return WorkerOutcome::Failed(JobFailure::from(&error)),
        };

        let mut aggregator = ChunkAggregator::new(AggregationOptions {
            iterable_key: invocation.iterable_key.clone(),
            ..AggregationOptions::default()
        })
        .with_progress(control.progress.clone());

        let mut decode_error = None;
        if let Some(stdout) = process.take_stdout() {
            let mut frames = FramedRead::new(stdout, ChunkDecoder::new(self.max_frame_bytes));
            let stop_reading = CancellationToken::new();
            let mut signalled = false;

            let result = {
                let consume = aggregator.consume(&mut frames, &stop_reading);
                tokio::pin!(consume);
                loop {
                    tokio::select! {
                        result = &mut consume => break result,
                        _ = control.terminate.cancelled(), if !signalled => {
                            process.terminate();
                            signalled = true;
                        }
                        _ = tokio::time::sleep(self.termination_grace), if signalled && !stop_reading.is_cancelled() => {
                            tracing::debug!("Output still open after termination grace, stop reading");
                            stop_reading.cancel();
                        }
                    }
                }
            };

            if let Err(error) = result {
                tracing::warn!("Aborting aggregation: {}", error.error_chain());
                process.terminate();
                decode_error = Some(error);
            }
        }

        let exit = process.wait().await;
        let stderr = exit
            .as_ref()
            .err()
            .and_then(|e| e.stderr())
            .unwrap_or_default()
            .to_string();

        if let Some(reason) = control.stop_reason() {
            return stopped_outcome(reason, control.timeout.get().copied(), stderr);
        }
        if let Some(error) = decode_error {
            return WorkerOutcome::Failed(decode_failure(&error).with_stderr(stderr));
        }

        match exit {
            Ok(_) => WorkerOutcome::Completed(aggregator.finish()),
            Err(error) => WorkerOutcome::Failed(JobFailure::from(&error)),
        }
    }
}

fn stopped_outcome(reason: StopReason, timeout: Option<Duration>, stderr: String) -> WorkerOutcome {
    match reason {
        StopReason::Timeout => {
            let message = match timeout {
                Some(timeout) => format!("Job exceeded its timeout of {:?}", timeout),
                None => "Job exceeded its timeout".to_string(),
            };
            WorkerOutcome::Failed(
                JobFailure::new(FailureReason::TimeoutExceeded, message).with_stderr(stderr),
            )
        }
        StopReason::Cancel | StopReason::Shutdown => WorkerOutcome::Cancelled,
    }
}

fn decode_failure(error: &StreamDecodeError) -> JobFailure {
    JobFailure::new(FailureReason::StreamDecode, error.to_string())
}
