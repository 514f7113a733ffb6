//! End-to-end tests: workflow JSON on disk through validation, compilation,
//! a supervised plugin run, result handoff and metrics.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use volterra_plugins::config::DEFAULT_QUEUE;
use volterra_plugins::jobs::{JobStatus, StaticLoadProbe};
use volterra_plugins::{
    InvocationBuilder, JobScheduler, MemoryResultSink, MetricsCollector, QueueConfig,
    SchedulerConfig, TrajectoryFrame, Workflow, WorkflowValidator,
};

fn write_plugin(dir: &Path, messages: &[Value]) -> PathBuf {
    let data = dir.join("output.bin");
    let mut bytes = Vec::new();
    for message in messages {
        bytes.extend(rmp_serde::to_vec(message).unwrap());
    }
    std::fs::write(&data, bytes).unwrap();

    let args_file = dir.join("argv.txt");
    let script = dir.join("plugin").join("cna").join("analyze");
    std::fs::create_dir_all(script.parent().unwrap()).unwrap();
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\necho \"$@\" > '{}'\ncat '{}'\n",
            args_file.display(),
            data.display()
        ),
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    script
}

/// Workflow as the editor saves it, each payload under its type's key
fn workflow_json() -> Value {
    json!({
        "nodes": [
            {"id": "mod", "type": "modifier", "position": {"x": 0.0, "y": 0.0},
             "data": {"modifier": {"name": "cna", "version": "1.0.0"}}},
            {"id": "args", "type": "arguments", "position": {"x": 0.0, "y": 120.0},
             "data": {"arguments": {"arguments": [
                {"argument": "cutoff", "type": "number", "default": 3.2},
                {"argument": "mode", "type": "select", "options": ["fast", "full"]}
            ]}}},
            {"id": "ep", "type": "entrypoint", "position": {"x": 0.0, "y": 240.0},
             "data": {"modifier": null, "entrypoint": {
                "binary": "analyze",
                "arguments": "{{ forEach.currentValue }} {{ arguments.as_str }}"
            }}},
            {"id": "exp", "type": "exposure", "position": {"x": 0.0, "y": 360.0},
             "data": {"exposure": {
                "name": "structures", "results": "structures.msgpack", "iterable": "data"
            }}}
        ],
        "edges": [
            {"id": "e1", "source": "mod", "target": "args"},
            {"id": "e2", "source": "args", "target": "ep"},
            {"id": "e3", "source": "ep", "target": "exp"}
        ]
    })
}

fn load_workflow(dir: &Path) -> Workflow {
    let path = dir.join("workflow.json");
    std::fs::write(&path, serde_json::to_string_pretty(&workflow_json()).unwrap()).unwrap();
    Workflow::load(&path).unwrap()
}

#[test]
fn test_loaded_workflow_validates_and_compiles() {
    let temp = TempDir::new().unwrap();
    let workflow = load_workflow(temp.path());
    assert!(WorkflowValidator::new().validate(&workflow).valid);

    let frame = TrajectoryFrame::new("traj").with_input("/dumps/dump.500");
    let values = HashMap::from([
        ("mode".to_string(), json!("full")),
        ("cutoff".to_string(), json!("not a number")),
    ]);
    let invocation = InvocationBuilder::new(temp.path().join("plugin"))
        .build(&workflow, &frame, &values, None)
        .unwrap();

    assert_eq!(
        invocation.binary_path,
        temp.path().join("plugin").join("cna").join("analyze")
    );
    assert_eq!(invocation.argv, vec!["/dumps/dump.500", "--mode", "full"]);
    assert!(invocation.arguments.is_partial());
    assert_eq!(invocation.arguments.dropped[0].key, "cutoff");
    assert_eq!(invocation.iterable_key.as_deref(), Some("data"));
}

#[tokio::test]
async fn test_scheduled_run_streams_into_sink_and_metrics() {
    let temp = TempDir::new().unwrap();
    write_plugin(
        temp.path(),
        &[
            json!({"timestep": 500, "data": [{"type": "FCC"}, {"type": "BCC"}]}),
            json!({"timestep": 500, "data": [{"type": "HCP"}]}),
        ],
    );
    let workflow = Arc::new(load_workflow(temp.path()));

    let config = SchedulerConfig::default()
        .with_plugins_dir(temp.path().join("plugin"))
        .with_queue(QueueConfig::new(DEFAULT_QUEUE).with_max_concurrent_jobs(2));
    let sink = Arc::new(MemoryResultSink::new());
    let scheduler = JobScheduler::builder(config)
        .with_load_probe(StaticLoadProbe::idle())
        .with_result_sink(sink.clone())
        .with_output_dir(temp.path())
        .start()
        .unwrap();
    let (metrics, handle) = MetricsCollector::attach(&scheduler);

    let frame = TrajectoryFrame::new("traj-7")
        .with_timestep(500)
        .with_input("/dumps/dump.500");
    let id = scheduler
        .submit(workflow, frame, HashMap::from([("mode".to_string(), json!("fast"))]))
        .await
        .unwrap();
    let job = tokio::time::timeout(Duration::from_secs(15), scheduler.wait(id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    let result = sink.result(&id).unwrap();
    assert_eq!(result.count, 3);
    assert_eq!(result.metadata, json!({"timestep": 500}));
    assert_eq!(result.exposure.as_deref(), Some("structures"));

    let argv = std::fs::read_to_string(temp.path().join("argv.txt")).unwrap();
    assert_eq!(argv.trim(), "/dumps/dump.500 --cutoff 3.2 --mode fast");

    tokio::time::timeout(Duration::from_secs(5), async {
        while metrics.snapshot().total_jobs_processed < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.total_jobs_failed, 0);
    assert_eq!(snapshot.running_jobs, 0);

    handle.stop().await;
    scheduler.shutdown().await;
}
