//! Batch executor.
//!
//! The executor owns a built dataflow and runs it one batch at a time.
//! Operators are evaluated in topological order. Independent nodes of one
//! level run on scoped worker threads when more than one worker is
//! configured; their outputs are merged in node order, so results never
//! depend on thread scheduling. Output tables are only touched once the
//! whole batch succeeded.

use crate::collection::KeyedTable;
use crate::dataflow::{Dataflow, Node, NodeId, NodeKind};
use crate::delta::{consolidate, Update};
use crate::error_log::{ErrorEntry, ErrorLog, StepContext};
use eddy_core::{Error, Result, Timestamp};
use hashbrown::HashMap;
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Outputs produced by one batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchOutput {
    pub time: Timestamp,
    /// Consolidated updates per output name
    pub tables: BTreeMap<String, Vec<Update>>,
}

impl BatchOutput {
    /// Returns the updates of one output, empty if it did not change.
    pub fn get(&self, name: &str) -> &[Update] {
        self.tables.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(Vec::is_empty)
    }
}

type StepResult = (NodeId, Result<Vec<Update>>, Vec<ErrorEntry>);

/// Runs a dataflow batch by batch.
pub struct Executor {
    nodes: Vec<Node>,
    levels: Vec<Vec<NodeId>>,
    workers: usize,
    inputs: HashMap<String, NodeId>,
    outputs: BTreeMap<String, (NodeId, KeyedTable)>,
    error_log: ErrorLog,
    last_time: Option<Timestamp>,
    poisoned: bool,
}

impl Executor {
    pub fn new(dataflow: Dataflow) -> Self {
        let graph = dataflow.into_graph();
        let levels = graph.topological_levels();
        let nodes = graph.into_nodes();
        let mut inputs = HashMap::new();
        let mut outputs = BTreeMap::new();
        for (id, node) in nodes.iter().enumerate() {
            match &node.kind {
                NodeKind::Input { name } => {
                    inputs.insert(name.clone(), id);
                }
                NodeKind::Output { name } => {
                    outputs.insert(name.clone(), (id, KeyedTable::new()));
                }
                NodeKind::Operator(_) => {}
            }
        }
        Self {
            nodes,
            levels,
            workers: 1,
            inputs,
            outputs,
            error_log: ErrorLog::new(),
            last_time: None,
            poisoned: false,
        }
    }

    /// Sets the number of worker threads used per level.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Returns the column count of a named input.
    pub fn input_arity(&self, name: &str) -> Option<usize> {
        self.inputs.get(name).map(|&id| self.nodes[id].arity)
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().map(String::as_str)
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    /// Returns the current snapshot of a named output.
    pub fn output_snapshot(&self, name: &str) -> Option<&KeyedTable> {
        self.outputs.get(name).map(|(_, table)| table)
    }

    #[inline]
    pub fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }

    pub fn error_log_mut(&mut self) -> &mut ErrorLog {
        &mut self.error_log
    }

    #[inline]
    pub fn last_time(&self) -> Option<Timestamp> {
        self.last_time
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Runs one batch.
    ///
    /// `inputs` maps input names to the updates closed at `time`. Either the
    /// whole batch is applied and its outputs returned, or an error is
    /// returned, no output is published and the executor refuses further
    /// batches.
    pub fn run_batch(
        &mut self,
        time: Timestamp,
        mut inputs: HashMap<String, Vec<Update>>,
    ) -> Result<BatchOutput> {
        if self.poisoned {
            return Err(Error::ExecutorPoisoned);
        }
        if let Some(last) = self.last_time {
            if time <= last {
                return Err(Error::LateChange {
                    time,
                    last_closed: last,
                });
            }
        }
        if let Some(name) = inputs.keys().find(|n| !self.inputs.contains_key(*n)) {
            return Err(Error::TableNotFound { name: name.clone() });
        }

        match self.evaluate(time, &mut inputs) {
            Ok(output) => {
                self.last_time = Some(time);
                Ok(output)
            }
            Err(err) => {
                error!(time = %time, error = %err, "batch failed, executor poisoned");
                self.poisoned = true;
                Err(err)
            }
        }
    }

    fn evaluate(
        &mut self,
        time: Timestamp,
        inputs: &mut HashMap<String, Vec<Update>>,
    ) -> Result<BatchOutput> {
        let mut results: Vec<Vec<Update>> = vec![Vec::new(); self.nodes.len()];
        let mut errors: Vec<ErrorEntry> = Vec::new();

        for level in &self.levels {
            let mut work: Vec<(NodeId, &mut Node)> = Vec::new();
            for (id, node) in self.nodes.iter_mut().enumerate() {
                if level.binary_search(&id).is_err() {
                    continue;
                }
                let runnable = match &node.kind {
                    NodeKind::Input { name } => {
                        results[id] = consolidate(inputs.remove(name).unwrap_or_default());
                        false
                    }
                    NodeKind::Output { .. } => {
                        let input = node.inputs[0];
                        results[id] = results[input].clone();
                        false
                    }
                    NodeKind::Operator(op) => {
                        let idle = node.inputs.iter().all(|&i| results[i].is_empty());
                        !idle || op.wants_idle_steps()
                    }
                };
                if runnable {
                    work.push((id, node));
                }
            }

            let mut step_results = run_level(work, &results, time, self.workers);
            step_results.sort_by_key(|(id, _, _)| *id);
            for (id, result, node_errors) in step_results {
                results[id] = consolidate(result?);
                errors.extend(node_errors);
            }
        }

        let mut output = BatchOutput {
            time,
            tables: BTreeMap::new(),
        };
        for (name, (id, table)) in &self.outputs {
            table.check_batch(&results[*id])?;
            output.tables.insert(name.clone(), std::mem::take(&mut results[*id]));
        }
        for (name, (_, table)) in self.outputs.iter_mut() {
            table.apply_unchecked(output.get(name));
        }
        debug!(
            time = %time,
            outputs = output.tables.values().map(Vec::len).sum::<usize>(),
            row_errors = errors.len(),
            "batch complete"
        );
        self.error_log.extend(errors);
        Ok(output)
    }
}

fn run_operator(id: NodeId, node: &mut Node, results: &[Vec<Update>], time: Timestamp) -> StepResult {
    let inputs: Vec<&[Update]> = node.inputs.iter().map(|&i| results[i].as_slice()).collect();
    match &mut node.kind {
        NodeKind::Operator(op) => {
            let mut ctx = StepContext::new(time, op.name());
            let result = op.step(&mut ctx, &inputs);
            (id, result, ctx.into_errors())
        }
        _ => (id, Ok(Vec::new()), Vec::new()),
    }
}

fn run_level(
    mut work: Vec<(NodeId, &mut Node)>,
    results: &[Vec<Update>],
    time: Timestamp,
    workers: usize,
) -> Vec<StepResult> {
    if workers <= 1 || work.len() <= 1 {
        return work
            .into_iter()
            .map(|(id, node)| run_operator(id, node, results, time))
            .collect();
    }
    let chunk_size = work.len().div_ceil(workers);
    std::thread::scope(|scope| {
        let handles: Vec<_> = work
            .chunks_mut(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter_mut()
                        .map(|(id, node)| run_operator(*id, node, results, time))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| match h.join() {
                Ok(results) => results,
                Err(_) => vec![(
                    usize::MAX,
                    Err(Error::invalid_operation("operator thread panicked")),
                    Vec::new(),
                )],
            })
            .collect()
    })
}
