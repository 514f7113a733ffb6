//! Structural and semantic validation of plugin workflows
//!
//! Validation never stops at the first problem: every error is collected so
//! an editor can highlight all of them in one pass.

use super::graph::WorkflowGraphAnalyzer;
use super::node::{NodeData, NodeType, WorkflowNode};
use super::Workflow;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Node types every executable workflow must contain
pub const REQUIRED_NODE_TYPES: [NodeType; 3] =
    [NodeType::Modifier, NodeType::Entrypoint, NodeType::Exposure];

/// A workflow that failed validation, carrying every problem found
#[derive(Debug, Clone, Error)]
#[error("Workflow validation failed: {}", .errors.join("; "))]
pub struct ValidationError {
    /// All validation problems, in report order
    pub errors: Vec<String>,
}

/// Outcome of validating a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Convert into a `Result`, keeping the full error list on failure
    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.valid {
            Ok(())
        } else {
            Err(ValidationError {
                errors: self.errors,
            })
        }
    }
}

/// Validates workflow graphs before execution
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkflowValidator;

impl WorkflowValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a workflow and report every problem found
    ///
    /// Errors are ordered: required-node errors, per-node errors in node
    /// order, duplicate IDs and dangling edges, then the cycle error.
    pub fn validate(&self, workflow: &Workflow) -> ValidationReport {
        if workflow.nodes.is_empty() {
            return ValidationReport::from_errors(vec![
                "Workflow must contain at least one node".to_string(),
            ]);
        }

        let mut errors = Vec::new();
        self.check_required_nodes(workflow, &mut errors);
        for node in &workflow.nodes {
            self.check_node(node, &mut errors);
        }
        self.check_references(workflow, &mut errors);

        if let Some(cycle) = WorkflowGraphAnalyzer::new(workflow).detect_cycle() {
            let path = cycle
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>()
                .join(" -> ");
            errors.push(format!("Workflow contains a cycle: {}", path));
        }

        if !errors.is_empty() {
            tracing::debug!("Workflow validation found {} problem(s)", errors.len());
        }
        ValidationReport::from_errors(errors)
    }

    /// Validate and fail with [`ValidationError`] if anything is wrong
    pub fn ensure_valid(&self, workflow: &Workflow) -> Result<(), ValidationError> {
        self.validate(workflow).into_result()
    }

    fn check_required_nodes(&self, workflow: &Workflow, errors: &mut Vec<String>) {
        let present: HashSet<NodeType> = workflow.nodes.iter().map(|n| n.node_type()).collect();
        for required in REQUIRED_NODE_TYPES {
            if !present.contains(&required) {
                let message = match required {
                    NodeType::Exposure => {
                        "Workflow must contain at least one Exposure node".to_string()
                    }
                    other => format!("Workflow must contain a {} node", other),
                };
                errors.push(message);
            }
        }
    }

    fn check_node(&self, node: &WorkflowNode, errors: &mut Vec<String>) {
        match &node.data {
            NodeData::Modifier(data) => {
                if data.name.trim().is_empty() {
                    errors.push(format!("Modifier node '{}' requires a name", node.id));
                }
            }
            NodeData::Entrypoint(data) => {
                if data.binary.trim().is_empty() {
                    errors.push(format!("Entrypoint node '{}' requires a binary", node.id));
                }
                if data.arguments.trim().is_empty() {
                    errors.push(format!(
                        "Entrypoint node '{}' requires an arguments template",
                        node.id
                    ));
                }
            }
            // No semantic rules for the remaining node kinds yet
            NodeData::Arguments(_)
            | NodeData::Context(_)
            | NodeData::ForEach(_)
            | NodeData::Exposure(_)
            | NodeData::Schema(_)
            | NodeData::Visualizers(_)
            | NodeData::Export(_)
            | NodeData::IfStatement(_) => {}
        }
    }

    fn check_references(&self, workflow: &Workflow, errors: &mut Vec<String>) {
        let mut seen = HashSet::new();
        for node in &workflow.nodes {
            if !seen.insert(&node.id) {
                errors.push(format!("Duplicate node ID '{}'", node.id));
            }
        }

        for edge in &workflow.edges {
            if !seen.contains(&edge.source) {
                errors.push(format!(
                    "Edge '{}' references non-existent source node '{}'",
                    edge.id, edge.source
                ));
            }
            if !seen.contains(&edge.target) {
                errors.push(format!(
                    "Edge '{}' references non-existent target node '{}'",
                    edge.id, edge.target
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::test_helpers::*;
    use crate::workflow::WorkflowEdge;

    #[test]
    fn test_valid_minimal_workflow() {
        let report = WorkflowValidator::new().validate(&create_minimal_workflow());
        assert!(report.valid, "unexpected errors: {:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_empty_workflow_short_circuits() {
        let report = WorkflowValidator::new().validate(&Workflow::default());
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("at least one node"));
    }

    #[test]
    fn test_each_missing_required_type_is_reported() {
        let cases = [
            (NodeType::Modifier, "Modifier"),
            (NodeType::Entrypoint, "Entrypoint"),
            (NodeType::Exposure, "Exposure"),
        ];

        for (missing, name) in cases {
            let mut workflow = create_minimal_workflow();
            workflow.nodes.retain(|n| n.node_type() != missing);
            workflow.edges.clear();

            let report = WorkflowValidator::new().validate(&workflow);
            assert!(!report.valid);
            assert!(
                report.errors.iter().any(|e| e.contains(name)),
                "expected an error mentioning {}: {:?}",
                name,
                report.errors
            );
        }
    }

    #[test]
    fn test_all_missing_types_reported_together() {
        let workflow = Workflow::new(vec![create_schema_node("schema")], vec![]);
        let report = WorkflowValidator::new().validate(&workflow);
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors[0].contains("Modifier"));
        assert!(report.errors[1].contains("Entrypoint"));
        assert!(report.errors[2].contains("Exposure"));
    }

    #[test]
    fn test_empty_modifier_name_and_entrypoint_fields() {
        let workflow = Workflow::new(
            vec![
                create_modifier_node("mod", ""),
                create_entrypoint_node("ep", "", ""),
                create_exposure_node("exp", "atoms", None),
            ],
            vec![],
        );

        let report = WorkflowValidator::new().validate(&workflow);
        assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
        assert!(report.errors[0].contains("Modifier node 'mod'"));
        assert!(report.errors[1].contains("requires a binary"));
        assert!(report.errors[2].contains("arguments template"));
    }

    #[test]
    fn test_cycle_is_reported_last() {
        let mut workflow = create_minimal_workflow();
        workflow.edges.push(WorkflowEdge::new("exp", "mod"));
        workflow.nodes.push(create_modifier_node("mod2", ""));

        let report = WorkflowValidator::new().validate(&workflow);
        assert!(!report.valid);
        let last = report.errors.last().unwrap();
        assert!(last.contains("cycle"), "{:?}", report.errors);
        assert!(report.errors[0].contains("Modifier node 'mod2'"));
    }

    #[test]
    fn test_cycle_in_disconnected_subgraph() {
        let mut workflow = create_minimal_workflow();
        workflow.nodes.push(create_schema_node("a"));
        workflow.nodes.push(create_schema_node("b"));
        workflow.edges.push(WorkflowEdge::new("a", "b"));
        workflow.edges.push(WorkflowEdge::new("b", "a"));

        let report = WorkflowValidator::new().validate(&workflow);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("cycle"));
    }

    #[test]
    fn test_dangling_edges_and_duplicate_ids() {
        let mut workflow = create_minimal_workflow();
        workflow.edges.push(WorkflowEdge::new("ep", "ghost"));
        workflow.nodes.push(create_schema_node("exp"));

        let report = WorkflowValidator::new().validate(&workflow);
        assert!(report.errors.iter().any(|e| e.contains("Duplicate node ID 'exp'")));
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("non-existent target node 'ghost'")));
    }

    #[test]
    fn test_ensure_valid_returns_all_errors() {
        let workflow = Workflow::new(vec![create_schema_node("only")], vec![]);
        let err = WorkflowValidator::new().ensure_valid(&workflow).unwrap_err();
        assert_eq!(err.errors.len(), 3);
        assert!(err.to_string().contains("Workflow validation failed"));
    }
}
