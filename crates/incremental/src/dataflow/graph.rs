//! Dataflow graph management.

use crate::dataflow::node::{Node, NodeId};
use eddy_core::{Error, Result};
use hashbrown::HashMap;
use std::collections::VecDeque;

/// A dataflow graph: an arena of nodes plus their dependency edges.
///
/// A node may only consume nodes added before it, so the graph is acyclic by
/// construction. Cycles exist only inside `iterate`, which runs its own
/// nested graph.
#[derive(Debug, Default)]
pub struct DataflowGraph {
    nodes: Vec<Node>,
    /// Map from node ID to nodes that consume it
    dependents: HashMap<NodeId, Vec<NodeId>>,
}

impl DataflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the graph and returns its ID.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        let id = self.nodes.len();
        if let Some(missing) = node.inputs.iter().find(|&&i| i >= id) {
            return Err(Error::invalid_operation(format!(
                "node {} consumes unknown node {}",
                node.name(),
                missing
            )));
        }
        for &input in &node.inputs {
            let deps = self.dependents.entry(input).or_default();
            if !deps.contains(&id) {
                deps.push(id);
            }
        }
        self.nodes.push(node);
        Ok(id)
    }

    #[inline]
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Returns the node IDs that consume the given node.
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        self.dependents.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    pub(crate) fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }

    /// Groups nodes into levels: every node's inputs lie in earlier levels.
    ///
    /// Nodes within one level are independent of each other and may be
    /// evaluated in parallel. Each level is sorted by node ID.
    pub fn topological_levels(&self) -> Vec<Vec<NodeId>> {
        let mut indegree: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| {
                let mut inputs = n.inputs.clone();
                inputs.sort_unstable();
                inputs.dedup();
                inputs.len()
            })
            .collect();
        let mut frontier: VecDeque<NodeId> =
            (0..self.nodes.len()).filter(|&i| indegree[i] == 0).collect();

        let mut levels = Vec::new();
        while !frontier.is_empty() {
            let mut level: Vec<NodeId> = frontier.drain(..).collect();
            level.sort_unstable();
            for &id in &level {
                for &dep in self.dependents(id) {
                    indegree[dep] -= 1;
                    if indegree[dep] == 0 {
                        frontier.push_back(dep);
                    }
                }
            }
            levels.push(level);
        }
        levels
    }
}
