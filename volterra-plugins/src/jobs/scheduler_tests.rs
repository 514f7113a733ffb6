use super::*;
use crate::config::{QueueConfig, SchedulerConfig, DEFAULT_QUEUE};
use crate::invocation::TrajectoryFrame;
use crate::test_utils::{plugin_workflow, write_script, write_streaming_script};
use crate::workflow::Workflow;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(15);

fn test_config(dir: &Path, slots: usize) -> SchedulerConfig {
    SchedulerConfig {
        plugins_dir: dir.to_path_buf(),
        tick_interval: Duration::from_millis(20),
        watchdog_interval: Duration::from_millis(50),
        load_sample_interval: Duration::from_millis(10),
        termination_grace: Duration::from_secs(1),
        ..SchedulerConfig::default()
    }
    .with_queue(
        QueueConfig::new(DEFAULT_QUEUE)
            .with_max_concurrent_jobs(slots)
            .with_thresholds(80.0, 80.0),
    )
}

fn start(dir: &Path, slots: usize, probe: StaticLoadProbe, sink: Arc<MemoryResultSink>) -> JobScheduler {
    JobScheduler::builder(test_config(dir, slots))
        .with_load_probe(probe)
        .with_result_sink(sink)
        .with_output_dir(dir)
        .start()
        .unwrap()
}

fn streaming_workflow(dir: &Path) -> Arc<Workflow> {
    let script = write_streaming_script(
        dir,
        "atoms",
        &[
            json!({"frame": 7, "data": [{"id": 1}, {"id": 2}]}),
            json!({"frame": 7, "data": [{"id": 3}]}),
        ],
    );
    Arc::new(plugin_workflow(&script, None))
}

fn frame() -> TrajectoryFrame {
    TrajectoryFrame::new("traj-1").with_timestep(100)
}

async fn wait_for(scheduler: &JobScheduler, id: JobId) -> Job {
    timeout(WAIT, scheduler.wait(id)).await.unwrap().unwrap()
}

async fn wait_until_running(scheduler: &JobScheduler, id: JobId) {
    timeout(WAIT, async {
        while scheduler.status(id).unwrap().status != JobStatus::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_completed_job_hands_result_to_sink() {
    let temp = TempDir::new().unwrap();
    let sink = Arc::new(MemoryResultSink::new());
    let scheduler = start(temp.path(), 2, StaticLoadProbe::idle(), sink.clone());
    let mut events = scheduler.subscribe();

    let id = scheduler
        .submit(streaming_workflow(temp.path()), frame(), HashMap::new())
        .await
        .unwrap();
    let job = wait_for(&scheduler, id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_count, Some(3));
    assert!(job.started_at.is_some() && job.finished_at.is_some());
    assert_eq!(job.metadata.plugin, "probe");
    assert_eq!(job.metadata.invocation.as_ref().unwrap().argv, vec!["100"]);

    let result = sink.result(&id).unwrap();
    assert_eq!(result.data, json!([{"id": 1}, {"id": 2}, {"id": 3}]));
    assert_eq!(result.metadata, json!({"frame": 7}));
    assert_eq!(result.exposure.as_deref(), Some("atoms"));
    assert_eq!(
        sink.status_history(&id),
        vec![JobStatus::Queued, JobStatus::Running, JobStatus::Completed]
    );

    let names = [
        events.recv().await.unwrap().name(),
        events.recv().await.unwrap().name(),
        events.recv().await.unwrap().name(),
    ];
    assert_eq!(names, ["queued", "started", "completed"]);

    let report = scheduler.status(id).unwrap();
    assert_eq!(report.progress.chunks, 2);
    assert!(report.error.is_none());
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_invalid_workflow_is_rejected_before_queueing() {
    let temp = TempDir::new().unwrap();
    let scheduler = start(temp.path(), 1, StaticLoadProbe::idle(), Arc::default());

    let result = scheduler
        .submit(Arc::new(Workflow::default()), frame(), HashMap::new())
        .await;
    assert!(matches!(result, Err(SchedulerError::Validation(_))));
    assert!(scheduler.jobs().is_empty());
}

#[tokio::test]
async fn test_unknown_queue_is_rejected() {
    let temp = TempDir::new().unwrap();
    let scheduler = start(temp.path(), 1, StaticLoadProbe::idle(), Arc::default());

    let request = JobRequest::new(streaming_workflow(temp.path()), frame()).with_queue("gpu");
    match scheduler.submit_request(request).await {
        Err(SchedulerError::UnknownQueue(name)) => assert_eq!(name, "gpu"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_high_load_keeps_job_queued_until_it_drops() {
    let temp = TempDir::new().unwrap();
    let probe = StaticLoadProbe::new(95.0, 10.0);
    let scheduler = start(temp.path(), 2, probe.clone(), Arc::default());

    let id = scheduler
        .submit(streaming_workflow(temp.path()), frame(), HashMap::new())
        .await
        .unwrap();

    // Several ticks with CPU above the threshold
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(scheduler.status(id).unwrap().status, JobStatus::Queued);

    probe.set(10.0, 10.0);
    assert_eq!(wait_for(&scheduler, id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_slot_limit_bounds_running_jobs() {
    let temp = TempDir::new().unwrap();
    let script = write_script(temp.path(), "nap", "sleep 0.4");
    let workflow = Arc::new(plugin_workflow(&script, None));
    let scheduler = start(temp.path(), 1, StaticLoadProbe::idle(), Arc::default());

    let first = scheduler
        .submit(workflow.clone(), frame(), HashMap::new())
        .await
        .unwrap();
    let second = scheduler
        .submit(workflow, frame().with_timestep(200), HashMap::new())
        .await
        .unwrap();

    wait_until_running(&scheduler, first).await;
    assert_eq!(scheduler.status(second).unwrap().status, JobStatus::Queued);

    assert_eq!(wait_for(&scheduler, first).await.status, JobStatus::Completed);
    assert_eq!(wait_for(&scheduler, second).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_timeout_terminates_once_and_fails_job() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("terms");
    let script = write_script(
        temp.path(),
        "stuck",
        &format!(
            "trap 'echo term >> {}; exit 0' TERM\nsleep 30 >/dev/null 2>&1 &\nwait $!",
            marker.display()
        ),
    );
    let workflow = Arc::new(plugin_workflow(&script, Some(200)));
    let scheduler = start(temp.path(), 1, StaticLoadProbe::idle(), Arc::default());

    let id = scheduler.submit(workflow, frame(), HashMap::new()).await.unwrap();
    let job = wait_for(&scheduler, id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.timeout_ms(), Some(200));
    let failure = job.failure.unwrap();
    assert_eq!(failure.reason, FailureReason::TimeoutExceeded);

    let terms = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(terms.lines().count(), 1);
}

#[tokio::test]
async fn test_timeout_fails_job_while_descendant_holds_pipes() {
    let temp = TempDir::new().unwrap();
    // No exec: the shell's sleep child keeps stdout and stderr open after SIGTERM
    let script = write_script(temp.path(), "wrapper", "echo warming up >&2\nsleep 8\nexit 0");
    let workflow = Arc::new(plugin_workflow(&script, Some(200)));
    let scheduler = start(temp.path(), 1, StaticLoadProbe::idle(), Arc::default());

    let started = std::time::Instant::now();
    let id = scheduler.submit(workflow, frame(), HashMap::new()).await.unwrap();
    let job = wait_for(&scheduler, id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure.unwrap().reason, FailureReason::TimeoutExceeded);
    assert!(started.elapsed() < Duration::from_secs(6), "took {:?}", started.elapsed());
}

#[tokio::test]
async fn test_queue_timeout_applies_when_entrypoint_has_none() {
    let temp = TempDir::new().unwrap();
    let script = write_script(temp.path(), "slow", "exec sleep 30");
    let config = test_config(temp.path(), 1).with_queue(
        QueueConfig::new(DEFAULT_QUEUE)
            .with_thresholds(80.0, 80.0)
            .with_timeout(Duration::from_millis(150)),
    );
    let scheduler = JobScheduler::builder(config)
        .with_load_probe(StaticLoadProbe::idle())
        .start()
        .unwrap();

    let id = scheduler
        .submit(Arc::new(plugin_workflow(&script, None)), frame(), HashMap::new())
        .await
        .unwrap();
    let job = wait_for(&scheduler, id).await;
    assert_eq!(job.timeout_ms(), Some(150));
    assert_eq!(job.failure.unwrap().reason, FailureReason::TimeoutExceeded);
}

#[tokio::test]
async fn test_cancel_queued_job_removes_it() {
    let temp = TempDir::new().unwrap();
    let sink = Arc::new(MemoryResultSink::new());
    let scheduler = start(temp.path(), 1, StaticLoadProbe::new(99.0, 99.0), sink.clone());

    let id = scheduler
        .submit(streaming_workflow(temp.path()), frame(), HashMap::new())
        .await
        .unwrap();
    assert!(scheduler.cancel(id).await.unwrap());
    assert!(!scheduler.cancel(id).await.unwrap());

    let job = scheduler.snapshot(id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.started_at.is_none());
    assert_eq!(
        sink.status_history(&id),
        vec![JobStatus::Queued, JobStatus::Cancelled]
    );
}

#[tokio::test]
async fn test_cancel_running_job_is_not_a_failure() {
    let temp = TempDir::new().unwrap();
    let script = write_script(temp.path(), "slow", "exec sleep 30");
    let scheduler = start(temp.path(), 1, StaticLoadProbe::idle(), Arc::default());

    let id = scheduler
        .submit(Arc::new(plugin_workflow(&script, None)), frame(), HashMap::new())
        .await
        .unwrap();
    wait_until_running(&scheduler, id).await;

    assert!(scheduler.cancel(id).await.unwrap());
    let job = wait_for(&scheduler, id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.failure.is_none());
}

#[tokio::test]
async fn test_unknown_job_is_reported() {
    let temp = TempDir::new().unwrap();
    let scheduler = start(temp.path(), 1, StaticLoadProbe::idle(), Arc::default());
    let id = JobId::new();

    assert!(matches!(scheduler.status(id), Err(SchedulerError::JobNotFound(_))));
    assert!(matches!(scheduler.cancel(id).await, Err(SchedulerError::JobNotFound(_))));
    assert!(matches!(
        scheduler.batch_progress(BatchId::new()),
        Err(SchedulerError::BatchNotFound(_))
    ));
}

#[tokio::test]
async fn test_failed_job_records_reason_and_stderr() {
    let temp = TempDir::new().unwrap();
    let script = write_script(temp.path(), "broken", "echo 'cannot open dump' >&2\nexit 3");
    let scheduler = start(temp.path(), 1, StaticLoadProbe::idle(), Arc::default());
    let mut events = scheduler.subscribe();

    let id = scheduler
        .submit(Arc::new(plugin_workflow(&script, None)), frame(), HashMap::new())
        .await
        .unwrap();
    let job = wait_for(&scheduler, id).await;

    let failure = job.failure.unwrap();
    assert_eq!(failure.reason, FailureReason::ProcessExitedNonZero);
    assert!(failure.stderr_tail.contains("cannot open dump"));

    let report = scheduler.status(id).unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.error.unwrap().reason, FailureReason::ProcessExitedNonZero);

    loop {
        if let JobEvent::Failed { job, error } = events.recv().await.unwrap() {
            assert_eq!(job.id, id);
            assert_eq!(error.reason, FailureReason::ProcessExitedNonZero);
            break;
        }
    }
}

#[tokio::test]
async fn test_malformed_stream_fails_only_that_job() {
    let temp = TempDir::new().unwrap();
    let garbage = write_script(temp.path(), "garbage", "printf '\\301\\301'");
    let scheduler = start(temp.path(), 2, StaticLoadProbe::idle(), Arc::default());

    let bad = scheduler
        .submit(Arc::new(plugin_workflow(&garbage, None)), frame(), HashMap::new())
        .await
        .unwrap();
    let job = wait_for(&scheduler, bad).await;
    assert_eq!(job.failure.unwrap().reason, FailureReason::StreamDecode);

    let good = scheduler
        .submit(streaming_workflow(temp.path()), frame(), HashMap::new())
        .await
        .unwrap();
    assert_eq!(wait_for(&scheduler, good).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_unresolvable_template_fails_as_invalid_invocation() {
    let temp = TempDir::new().unwrap();
    let script = write_script(temp.path(), "noop", "exit 0");
    let mut workflow = plugin_workflow(&script, None);
    for node in &mut workflow.nodes {
        if let crate::workflow::NodeData::Entrypoint(data) = &mut node.data {
            data.arguments = "{{ nothing.here }}".to_string();
        }
    }
    let scheduler = start(temp.path(), 1, StaticLoadProbe::idle(), Arc::default());

    let id = scheduler
        .submit(Arc::new(workflow), frame(), HashMap::new())
        .await
        .unwrap();
    let job = wait_for(&scheduler, id).await;
    assert_eq!(job.failure.unwrap().reason, FailureReason::InvalidInvocation);
    assert!(job.metadata.invocation.is_none());
}

#[tokio::test]
async fn test_retry_failed_creates_new_jobs_once() {
    let temp = TempDir::new().unwrap();
    let data = temp.path().join("flaky.bin");
    std::fs::write(
        &data,
        crate::test_utils::encode_messages(&[json!({"data": [1]})]),
    )
    .unwrap();
    let marker = temp.path().join("attempted");
    let script = write_script(
        temp.path(),
        "flaky",
        &format!(
            "if [ -f {m} ]; then cat {d}; else touch {m}; echo 'first run' >&2; exit 3; fi",
            m = marker.display(),
            d = data.display()
        ),
    );
    let scheduler = start(temp.path(), 1, StaticLoadProbe::idle(), Arc::default());

    let failed = scheduler
        .submit(Arc::new(plugin_workflow(&script, None)), frame(), HashMap::new())
        .await
        .unwrap();
    assert_eq!(wait_for(&scheduler, failed).await.status, JobStatus::Failed);

    assert_eq!(scheduler.retry_failed("other-trajectory").await.unwrap(), 0);
    assert_eq!(scheduler.retry_failed("traj-1").await.unwrap(), 1);
    assert_eq!(scheduler.retry_failed("traj-1").await.unwrap(), 0);

    let retry = scheduler
        .jobs()
        .into_iter()
        .find(|job| job.metadata.retry_of == Some(failed))
        .unwrap();
    assert_ne!(retry.id, failed);
    assert_eq!(wait_for(&scheduler, retry.id).await.status, JobStatus::Completed);

    // Failed history is left untouched
    assert_eq!(scheduler.snapshot(failed).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_batch_tracks_progress_of_every_frame() {
    let temp = TempDir::new().unwrap();
    let scheduler = start(temp.path(), 2, StaticLoadProbe::idle(), Arc::default());

    let frames = (0..3)
        .map(|i| TrajectoryFrame::new("traj-9").with_index(i))
        .collect::<Vec<_>>();
    let batch = scheduler
        .submit_batch(streaming_workflow(temp.path()), frames, HashMap::new())
        .await
        .unwrap();
    assert_eq!(batch.job_ids.len(), 3);

    for id in &batch.job_ids {
        wait_for(&scheduler, *id).await;
    }
    let progress = scheduler.batch_progress(batch.id).unwrap();
    assert_eq!(
        progress,
        BatchProgress {
            total: 3,
            remaining: 0,
            completed: 3,
            failed: 0,
            cancelled: 0,
        }
    );
    for id in &batch.job_ids {
        assert_eq!(scheduler.snapshot(*id).unwrap().metadata.batch_id, Some(batch.id));
    }
}

#[tokio::test]
async fn test_timestep_override_reaches_invocation() {
    let temp = TempDir::new().unwrap();
    let scheduler = start(temp.path(), 1, StaticLoadProbe::idle(), Arc::default());

    let request = JobRequest::new(
        streaming_workflow(temp.path()),
        TrajectoryFrame::new("traj-1").with_index(4),
    )
    .with_timestep(2500);
    let id = scheduler.submit_request(request).await.unwrap();

    let job = wait_for(&scheduler, id).await;
    assert_eq!(job.metadata.invocation.unwrap().argv, vec!["2500"]);
}

#[tokio::test]
async fn test_shutdown_cancels_unfinished_jobs() {
    let temp = TempDir::new().unwrap();
    let script = write_script(temp.path(), "slow", "exec sleep 30");
    let workflow = Arc::new(plugin_workflow(&script, None));
    let scheduler = start(temp.path(), 1, StaticLoadProbe::idle(), Arc::default());

    let running = scheduler
        .submit(workflow.clone(), frame(), HashMap::new())
        .await
        .unwrap();
    let queued = scheduler.submit(workflow.clone(), frame(), HashMap::new()).await.unwrap();
    wait_until_running(&scheduler, running).await;

    timeout(WAIT, scheduler.shutdown()).await.unwrap();

    assert_eq!(scheduler.snapshot(running).unwrap().status, JobStatus::Cancelled);
    assert_eq!(scheduler.snapshot(queued).unwrap().status, JobStatus::Cancelled);
    assert!(matches!(
        scheduler.submit(workflow, frame(), HashMap::new()).await,
        Err(SchedulerError::ShutDown)
    ));
}
