//! Plugin workflow data structures and validation
//!
//! A plugin is authored as a graph of typed nodes. This module holds the
//! in-memory graph, the graph queries used to compose an invocation, and the
//! validator that runs before anything is executed.

mod definition;
mod graph;
mod node;
mod validation;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use definition::{Workflow, WorkflowEdge, WorkflowLoadError};
pub use graph::{GraphError, GraphResult, WorkflowGraphAnalyzer};
pub use node::{
    ArgumentDefinition, ArgumentsData, ConditionHandler, ConditionJoin, ContextData,
    ContextSource, EntrypointData, ExportData, ExportFormat, Exporter, ExposureData,
    ForEachData, IfStatementCondition, IfStatementData, ModifierData, NodeData, NodeId,
    NodePosition, NodeType, SchemaData, VisualizersData, WorkflowNode,
};
pub use validation::{ValidationError, ValidationReport, WorkflowValidator, REQUIRED_NODE_TYPES};
