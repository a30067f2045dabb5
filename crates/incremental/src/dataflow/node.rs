//! Dataflow node definitions.

use crate::delta::Update;
use crate::error_log::StepContext;
use eddy_core::Result;

/// Index of a node in the dataflow graph.
pub type NodeId = usize;

/// Column index within a row.
pub type ColumnId = usize;

/// A stateful or stateless transformation of keyed update streams.
///
/// An operator owns its state exclusively. The executor calls `step` once per
/// batch with the consolidated updates of each input, in input order, and
/// never from two threads at the same time.
pub trait Operator: Send {
    /// Short name used in logs and error entries.
    fn name(&self) -> &str;

    /// Processes the updates of one batch and returns the output updates.
    fn step(&mut self, ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>>;

    /// Whether `step` must run even when no input changed in a batch.
    fn wants_idle_steps(&self) -> bool {
        false
    }
}

/// What a node does.
pub enum NodeKind {
    /// Entry point for one named input
    Input { name: String },
    /// An operator over the outputs of other nodes
    Operator(Box<dyn Operator>),
    /// A named output collecting its single input
    Output { name: String },
}

/// A node in the dataflow graph.
pub struct Node {
    pub kind: NodeKind,
    pub inputs: Vec<NodeId>,
    /// Number of columns in the rows this node produces
    pub arity: usize,
}

impl Node {
    pub fn input(name: impl Into<String>, arity: usize) -> Self {
        Self {
            kind: NodeKind::Input { name: name.into() },
            inputs: Vec::new(),
            arity,
        }
    }

    pub fn operator(op: Box<dyn Operator>, inputs: Vec<NodeId>, arity: usize) -> Self {
        Self {
            kind: NodeKind::Operator(op),
            inputs,
            arity,
        }
    }

    pub fn output(name: impl Into<String>, input: NodeId, arity: usize) -> Self {
        Self {
            kind: NodeKind::Output { name: name.into() },
            inputs: vec![input],
            arity,
        }
    }

    /// Returns a display name for the node.
    pub fn name(&self) -> &str {
        match &self.kind {
            NodeKind::Input { name } | NodeKind::Output { name } => name,
            NodeKind::Operator(op) => op.name(),
        }
    }

    /// Returns the input name if this is an input node.
    pub fn input_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Input { name } => Some(name),
            _ => None,
        }
    }

    /// Returns the output name if this is an output node.
    pub fn output_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Output { name } => Some(name),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("inputs", &self.inputs)
            .field("arity", &self.arity)
            .finish()
    }
}
