//! Dataflow graph construction.
//!
//! A [`Dataflow`] is built once, then handed to an
//! [`Executor`](crate::executor::Executor) which owns it. Builder methods
//! return [`TableRef`] handles naming the node that produces a table. The
//! operator modules extend `Dataflow` with one method per operation.

mod graph;
pub mod node;

pub use graph::DataflowGraph;
pub use node::{ColumnId, Node, NodeId, NodeKind, Operator};

use eddy_core::schema::Schema;
use eddy_core::{Error, Result};

/// Handle to a table produced by a dataflow node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub node: NodeId,
    pub arity: usize,
}

impl TableRef {
    /// Checks that `column` exists in this table.
    pub fn check_column(&self, column: ColumnId) -> Result<()> {
        if column < self.arity {
            Ok(())
        } else {
            Err(Error::column_not_found(format!(
                "#{column} (table has {} columns)",
                self.arity
            )))
        }
    }

    pub fn check_columns(&self, columns: &[ColumnId]) -> Result<()> {
        columns.iter().try_for_each(|&c| self.check_column(c))
    }
}

/// Builder for a dataflow graph.
#[derive(Debug, Default)]
pub struct Dataflow {
    graph: DataflowGraph,
    inputs: Vec<(String, NodeId)>,
    outputs: Vec<(String, NodeId)>,
}

impl Dataflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a named input table with the given number of columns.
    pub fn input(&mut self, name: impl Into<String>, arity: usize) -> Result<TableRef> {
        let name = name.into();
        if self.inputs.iter().any(|(n, _)| *n == name) {
            return Err(Error::invalid_operation(format!("duplicate input {name}")));
        }
        let node = self.graph.add_node(Node::input(name.clone(), arity))?;
        self.inputs.push((name, node));
        Ok(TableRef { node, arity })
    }

    /// Declares an input table described by a schema.
    pub fn input_schema(&mut self, schema: &Schema) -> Result<TableRef> {
        self.input(schema.name(), schema.arity())
    }

    /// Marks a table as a named output.
    pub fn output(&mut self, name: impl Into<String>, table: TableRef) -> Result<()> {
        let name = name.into();
        if self.outputs.iter().any(|(n, _)| *n == name) {
            return Err(Error::invalid_operation(format!("duplicate output {name}")));
        }
        let node = self
            .graph
            .add_node(Node::output(name.clone(), table.node, table.arity))?;
        self.outputs.push((name, node));
        Ok(())
    }

    /// Adds an operator consuming `inputs` and producing rows of `arity` columns.
    pub fn add_operator<O>(&mut self, inputs: &[TableRef], arity: usize, op: O) -> Result<TableRef>
    where
        O: Operator + 'static,
    {
        let node = self.graph.add_node(Node::operator(
            Box::new(op),
            inputs.iter().map(|t| t.node).collect(),
            arity,
        ))?;
        Ok(TableRef { node, arity })
    }

    #[inline]
    pub fn graph(&self) -> &DataflowGraph {
        &self.graph
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|(n, _)| n.as_str())
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(n, _)| n.as_str())
    }

    pub(crate) fn into_graph(self) -> DataflowGraph {
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_names_rejected() {
        let mut df = Dataflow::new();
        let t = df.input("t", 2).unwrap();
        assert!(df.input("t", 2).is_err());
        df.output("out", t).unwrap();
        assert!(df.output("out", t).is_err());
        assert_eq!(df.input_names().collect::<Vec<_>>(), vec!["t"]);
    }

    #[test]
    fn test_check_column() {
        let t = TableRef { node: 0, arity: 2 };
        assert!(t.check_column(1).is_ok());
        assert!(t.check_columns(&[0, 2]).is_err());
    }
}
