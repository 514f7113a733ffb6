//! Test utilities shared by the process, stream and jobs tests
//!
//! Plugin binaries are simulated with small `/bin/sh` scripts written into a
//! temporary directory. Streamed output is produced by encoding messages with
//! `rmp-serde` into a file the script `cat`s to stdout.

#![cfg(test)]

use crate::workflow::test_helpers::{create_exposure_node, create_modifier_node};
use crate::workflow::{EntrypointData, NodeData, Workflow, WorkflowEdge, WorkflowNode};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Write an executable shell script and return its path
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Encode messages back to back as a MessagePack stream
pub fn encode_messages(messages: &[Value]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for message in messages {
        bytes.extend(rmp_serde::to_vec(message).unwrap());
    }
    bytes
}

/// Write the encoded stream to `{name}.bin` and a script that prints it
pub fn write_streaming_script(dir: &Path, name: &str, messages: &[Value]) -> PathBuf {
    let data = dir.join(format!("{}.bin", name));
    std::fs::write(&data, encode_messages(messages)).unwrap();
    write_script(dir, name, &format!("cat '{}'", data.display()))
}

/// Smallest valid workflow running `binary` with the frame's input as its
/// only argument and exposing the `data` key of every message
pub fn plugin_workflow(binary: &Path, timeout_ms: Option<u64>) -> Workflow {
    Workflow::new(
        vec![
            create_modifier_node("mod", "probe"),
            WorkflowNode::new(
                "ep",
                NodeData::Entrypoint(EntrypointData {
                    binary: binary.display().to_string(),
                    arguments: "{{ forEach.currentValue }}".to_string(),
                    timeout_ms,
                    ..Default::default()
                }),
            ),
            create_exposure_node("exp", "atoms", Some("data")),
        ],
        vec![WorkflowEdge::new("mod", "ep"), WorkflowEdge::new("ep", "exp")],
    )
}
