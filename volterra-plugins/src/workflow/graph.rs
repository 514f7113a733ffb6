//! Graph utilities for workflow analysis
//!
//! This module provides the graph operations the validator and the
//! invocation builder need: adjacency, cycle detection, topological
//! ordering and typed upstream/downstream lookups.

use super::node::{NodeId, NodeType, WorkflowNode};
use super::Workflow;
use std::collections::{HashMap, HashSet, VecDeque};

/// Result of graph analysis operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors that can occur during graph analysis
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A cycle was detected in the graph; the path starts and ends on the same node
    #[error("Graph contains a cycle: {}", format_path(.0))]
    CycleDetected(Vec<NodeId>),

    /// The specified node was not found in the workflow
    #[error("Node not found in workflow: {0}")]
    NodeNotFound(NodeId),
}

fn format_path(path: &[NodeId]) -> String {
    path.iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Analyzes workflow graph structure
pub struct WorkflowGraphAnalyzer<'a> {
    workflow: &'a Workflow,
    index: HashMap<&'a NodeId, &'a WorkflowNode>,
}

impl<'a> WorkflowGraphAnalyzer<'a> {
    /// Creates a new graph analyzer for the given workflow
    pub fn new(workflow: &'a Workflow) -> Self {
        let index = workflow.nodes.iter().map(|node| (&node.id, node)).collect();
        Self { workflow, index }
    }

    /// Whether the workflow has a node with the given ID
    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Builds an adjacency list representation of the workflow graph
    ///
    /// Every node gets an entry. Edges whose endpoints do not both exist are
    /// left out; the validator reports those separately.
    pub fn build_adjacency_list(&self) -> HashMap<NodeId, Vec<NodeId>> {
        let mut adjacency: HashMap<NodeId, Vec<NodeId>> = self
            .workflow
            .nodes
            .iter()
            .map(|node| (node.id.clone(), Vec::new()))
            .collect();

        for edge in &self.workflow.edges {
            if !self.contains(&edge.target) {
                continue;
            }
            if let Some(neighbors) = adjacency.get_mut(&edge.source) {
                neighbors.push(edge.target.clone());
            }
        }

        adjacency
    }

    /// Detects a cycle anywhere in the graph
    ///
    /// Depth-first search restarted from every unvisited node, so each
    /// disconnected subgraph is checked and every node is visited once.
    pub fn detect_cycle(&self) -> Option<Vec<NodeId>> {
        let adjacency = self.build_adjacency_list();
        let mut visited = HashSet::new();

        for node in &self.workflow.nodes {
            if visited.contains(&node.id) {
                continue;
            }
            let mut stack = Vec::new();
            let mut on_stack = HashSet::new();
            if let Some(cycle) =
                Self::cycle_dfs(&node.id, &adjacency, &mut visited, &mut stack, &mut on_stack)
            {
                return Some(cycle);
            }
        }

        None
    }

    /// Fails with [`GraphError::CycleDetected`] if the graph has a cycle
    pub fn ensure_acyclic(&self) -> GraphResult<()> {
        match self.detect_cycle() {
            Some(cycle) => Err(GraphError::CycleDetected(cycle)),
            None => Ok(()),
        }
    }

    /// Performs topological sort on the workflow graph
    ///
    /// Ties are broken by node order so the result is deterministic.
    /// Returns None if the graph contains cycles.
    pub fn topological_sort(&self) -> Option<Vec<&'a WorkflowNode>> {
        let adjacency = self.build_adjacency_list();
        let mut in_degree: HashMap<&NodeId, usize> =
            self.workflow.nodes.iter().map(|node| (&node.id, 0)).collect();

        for neighbors in adjacency.values() {
            for neighbor in neighbors {
                if let Some(degree) = in_degree.get_mut(neighbor) {
                    *degree += 1;
                }
            }
        }

        let mut queue: VecDeque<&NodeId> = self
            .workflow
            .nodes
            .iter()
            .map(|node| &node.id)
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();

        let mut sorted = Vec::with_capacity(self.workflow.nodes.len());

        while let Some(id) = queue.pop_front() {
            if let Some(node) = self.index.get(id) {
                sorted.push(*node);
            }
            if let Some(neighbors) = adjacency.get(id) {
                for neighbor in neighbors {
                    if let Some(degree) = in_degree.get_mut(neighbor) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(neighbor);
                        }
                    }
                }
            }
        }

        if sorted.len() == self.workflow.nodes.len() {
            Some(sorted)
        } else {
            None
        }
    }

    /// Walks up the first incoming edge of each node until a node of the
    /// given type is found
    pub fn find_parent_by_type(&self, from: &NodeId, node_type: NodeType) -> Option<&'a WorkflowNode> {
        let mut current = from.clone();
        let mut seen = HashSet::new();

        while seen.insert(current.clone()) {
            let edge = self.workflow.incoming(&current).next()?;
            let parent = self.index.get(&edge.source)?;
            if parent.node_type() == node_type {
                return Some(*parent);
            }
            current = edge.source.clone();
        }

        None
    }

    /// First direct child of the given type, in edge order
    pub fn find_child_by_type(&self, from: &NodeId, node_type: NodeType) -> Option<&'a WorkflowNode> {
        self.workflow
            .outgoing(from)
            .filter_map(|edge| self.index.get(&edge.target).copied())
            .find(|node| node.node_type() == node_type)
    }

    /// Nearest upstream node of the given type (breadth-first)
    pub fn find_ancestor_by_type(&self, from: &NodeId, node_type: NodeType) -> Option<&'a WorkflowNode> {
        self.breadth_first(from, node_type, Direction::Upstream)
    }

    /// Nearest downstream node of the given type (breadth-first)
    pub fn find_descendant_by_type(&self, from: &NodeId, node_type: NodeType) -> Option<&'a WorkflowNode> {
        self.breadth_first(from, node_type, Direction::Downstream)
    }

    /// All nodes reachable from `start` through edges leaving it on the given
    /// source handle, in discovery order
    ///
    /// Used to collect the nodes on one branch of an if-statement.
    pub fn find_descendants_on_branch(&self, start: &NodeId, handle: &str) -> Vec<&'a WorkflowNode> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(start.clone());

        let mut queue: VecDeque<NodeId> = self
            .workflow
            .outgoing(start)
            .filter(|edge| edge.source_handle.as_deref() == Some(handle))
            .map(|edge| edge.target.clone())
            .collect();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let Some(node) = self.index.get(&id) else {
                continue;
            };
            result.push(*node);
            for edge in self.workflow.outgoing(&id) {
                queue.push_back(edge.target.clone());
            }
        }

        result
    }

    /// Exposure node whose name matches, ignoring case
    pub fn find_exposure_by_name(&self, name: &str) -> Option<&'a WorkflowNode> {
        self.workflow.nodes.iter().find(|node| {
            node.as_exposure()
                .map(|exposure| exposure.name.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })
    }

    fn breadth_first(
        &self,
        from: &NodeId,
        node_type: NodeType,
        direction: Direction,
    ) -> Option<&'a WorkflowNode> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(from.clone());

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let next: Vec<NodeId> = match direction {
                Direction::Upstream => self
                    .workflow
                    .incoming(&current)
                    .map(|edge| edge.source.clone())
                    .collect(),
                Direction::Downstream => self
                    .workflow
                    .outgoing(&current)
                    .map(|edge| edge.target.clone())
                    .collect(),
            };
            for id in next {
                if let Some(node) = self.index.get(&id) {
                    if node.node_type() == node_type {
                        return Some(*node);
                    }
                    queue.push_back(id);
                }
            }
        }

        None
    }

    // Helper method for cycle detection using DFS
    fn cycle_dfs(
        node: &NodeId,
        adjacency: &HashMap<NodeId, Vec<NodeId>>,
        visited: &mut HashSet<NodeId>,
        stack: &mut Vec<NodeId>,
        on_stack: &mut HashSet<NodeId>,
    ) -> Option<Vec<NodeId>> {
        visited.insert(node.clone());
        stack.push(node.clone());
        on_stack.insert(node.clone());

        if let Some(neighbors) = adjacency.get(node) {
            for neighbor in neighbors {
                if on_stack.contains(neighbor) {
                    // Back edge: trim the stack to just the cycle
                    let start = stack.iter().position(|id| id == neighbor).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(neighbor.clone());
                    return Some(cycle);
                }
                if !visited.contains(neighbor) {
                    if let Some(cycle) = Self::cycle_dfs(neighbor, adjacency, visited, stack, on_stack)
                    {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        on_stack.remove(node);
        None
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Upstream,
    Downstream,
}
