//! Workflow graph definition

use super::node::{
    ArgumentsData, EntrypointData, ExposureData, ModifierData, NodeId, NodeType, WorkflowNode,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading a workflow document
#[derive(Debug, Error)]
pub enum WorkflowLoadError {
    /// The workflow file could not be read
    #[error("Failed to read workflow file {path}: {source}")]
    Read {
        /// Path of the workflow file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The document is not a valid workflow
    #[error("Invalid workflow document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A directed connection between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEdge {
    #[serde(default)]
    pub id: String,
    pub source: NodeId,
    /// Output port on the source node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target: NodeId,
    /// Input port on the target node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl WorkflowEdge {
    /// Create an edge between two nodes without port discriminators
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            source_handle: None,
            target,
            target_handle: None,
        }
    }

    /// Set the source port
    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }
}

/// A plugin workflow: typed nodes plus the edges between them
///
/// Loaded read-only for execution; nothing in this crate mutates a workflow
/// after it has been validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

impl Workflow {
    /// Create a workflow from nodes and edges
    pub fn new(nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) -> Self {
        Self { nodes, edges }
    }

    /// Parse a workflow from its JSON form
    pub fn from_json(content: &str) -> Result<Self, WorkflowLoadError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a workflow JSON document from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WorkflowLoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| WorkflowLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Look up a node by ID
    pub fn node(&self, id: &NodeId) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    /// All nodes of the given type, in node order
    pub fn nodes_of_type(&self, node_type: NodeType) -> impl Iterator<Item = &WorkflowNode> {
        self.nodes
            .iter()
            .filter(move |node| node.node_type() == node_type)
    }

    /// First node of the given type, in node order
    pub fn first_of_type(&self, node_type: NodeType) -> Option<&WorkflowNode> {
        self.nodes_of_type(node_type).next()
    }

    /// Plugin identity
    pub fn modifier(&self) -> Option<&ModifierData> {
        self.first_of_type(NodeType::Modifier)
            .and_then(WorkflowNode::as_modifier)
    }

    /// The entrypoint node and its payload
    pub fn entrypoint(&self) -> Option<(&WorkflowNode, &EntrypointData)> {
        self.first_of_type(NodeType::Entrypoint)
            .and_then(|node| node.as_entrypoint().map(|data| (node, data)))
    }

    /// Argument declarations, if the workflow has an Arguments node
    pub fn arguments(&self) -> Option<&ArgumentsData> {
        self.first_of_type(NodeType::Arguments)
            .and_then(WorkflowNode::as_arguments)
    }

    /// All exposure payloads, in node order
    pub fn exposures(&self) -> impl Iterator<Item = (&WorkflowNode, &ExposureData)> {
        self.nodes
            .iter()
            .filter_map(|node| node.as_exposure().map(|data| (node, data)))
    }

    /// Edges leaving the given node
    pub fn outgoing(&self, id: &NodeId) -> impl Iterator<Item = &WorkflowEdge> {
        let id = id.clone();
        self.edges.iter().filter(move |edge| edge.source == id)
    }

    /// Edges entering the given node
    pub fn incoming(&self, id: &NodeId) -> impl Iterator<Item = &WorkflowEdge> {
        let id = id.clone();
        self.edges.iter().filter(move |edge| edge.target == id)
    }
}
