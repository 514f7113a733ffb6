//! Test helper functions for workflow module
//!
//! This module provides common builders for workflow tests across the crate.

#![cfg(test)]

use crate::invocation::{ArgumentDeclaration, ArgumentType};
use crate::workflow::{
    ArgumentDefinition, ArgumentsData, EntrypointData, ExposureData, ModifierData, NodeData,
    NodeType, SchemaData, Workflow, WorkflowEdge, WorkflowNode,
};

/// Test helper to create a modifier node
pub fn create_modifier_node(id: &str, name: &str) -> WorkflowNode {
    WorkflowNode::new(
        id,
        NodeData::Modifier(ModifierData {
            name: name.to_string(),
            ..Default::default()
        }),
    )
}

/// Test helper to create an entrypoint node
pub fn create_entrypoint_node(id: &str, binary: &str, arguments: &str) -> WorkflowNode {
    WorkflowNode::new(
        id,
        NodeData::Entrypoint(EntrypointData {
            binary: binary.to_string(),
            arguments: arguments.to_string(),
            ..Default::default()
        }),
    )
}

/// Test helper to create an exposure node
pub fn create_exposure_node(id: &str, name: &str, iterable: Option<&str>) -> WorkflowNode {
    WorkflowNode::new(
        id,
        NodeData::Exposure(ExposureData {
            name: name.to_string(),
            results: format!("{}.msgpack", name),
            iterable: iterable.map(str::to_string),
        }),
    )
}

/// Test helper to create a schema node
pub fn create_schema_node(id: &str) -> WorkflowNode {
    WorkflowNode::new(id, NodeData::Schema(SchemaData::default()))
}

/// Test helper to create a node of any type with default data
#[allow(dead_code)]
pub fn create_default_node(id: &str, node_type: NodeType) -> WorkflowNode {
    WorkflowNode::new(id, node_type.default_data())
}

/// Test helper to create an arguments node from `(key, type)` pairs
pub fn create_arguments_node(id: &str, arguments: &[(&str, ArgumentType)]) -> WorkflowNode {
    WorkflowNode::new(
        id,
        NodeData::Arguments(ArgumentsData {
            arguments: arguments
                .iter()
                .map(|(key, kind)| ArgumentDefinition {
                    argument: key.to_string(),
                    declaration: ArgumentDeclaration::new(*kind),
                })
                .collect(),
        }),
    )
}

/// Modifier -> Arguments -> Entrypoint -> Exposure, the smallest valid plugin
pub fn create_minimal_workflow() -> Workflow {
    Workflow::new(
        vec![
            create_modifier_node("mod", "demo"),
            create_arguments_node("args", &[("cutoff", ArgumentType::Number)]),
            create_entrypoint_node(
                "ep",
                "analyze",
                "{{ forEach.currentValue }} {{ forEach.outputPath }} {{ arguments.as_str }}",
            ),
            create_exposure_node("exp", "atoms", Some("data")),
        ],
        vec![
            WorkflowEdge::new("mod", "args"),
            WorkflowEdge::new("args", "ep"),
            WorkflowEdge::new("ep", "exp"),
        ],
    )
}
