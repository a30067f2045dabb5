//! Incremental filter operator.

use crate::dataflow::{Dataflow, Operator, TableRef};
use crate::delta::{Delta, Update};
use crate::error_log::StepContext;
use eddy_core::{DataResult, Result, Row};
use std::sync::Arc;

/// Applies a filter predicate to a batch of deltas.
///
/// Only deltas whose data satisfies the predicate are passed through.
/// The diff values are preserved.
pub fn filter_incremental<T, F>(input: &[Delta<T>], mut predicate: F) -> Vec<Delta<T>>
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    input
        .iter()
        .filter(|d| predicate(&d.data))
        .cloned()
        .collect()
}

/// A per-row predicate.
pub type Predicate = Arc<dyn Fn(&Row) -> DataResult<bool> + Send + Sync>;

/// Keeps the rows matching a predicate.
///
/// A row whose predicate fails is dropped and reported.
pub struct Filter {
    predicate: Predicate,
}

impl Operator for Filter {
    fn name(&self) -> &str {
        "filter"
    }

    fn step(&mut self, ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let mut failed = Vec::new();
        let out = filter_incremental(inputs[0], |(key, row)| match (self.predicate)(row) {
            Ok(keep) => keep,
            Err(err) => {
                failed.push((*key, err));
                false
            }
        });
        for (key, err) in failed {
            ctx.report(Some(key), &err);
        }
        Ok(out)
    }
}

impl Dataflow {
    /// Keeps the rows for which `predicate` returns true.
    pub fn filter<F>(&mut self, table: TableRef, predicate: F) -> Result<TableRef>
    where
        F: Fn(&Row) -> DataResult<bool> + Send + Sync + 'static,
    {
        self.add_operator(
            &[table],
            table.arity,
            Filter {
                predicate: Arc::new(predicate),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::{row, DataError, Key, Timestamp, Value};

    #[test]
    fn test_filter_incremental_preserves_diff() {
        let deltas = vec![Delta::insert(10), Delta::insert(3), Delta::delete(20)];
        let filtered = filter_incremental(&deltas, |&x| x > 5);
        assert_eq!(filtered, vec![Delta::insert(10), Delta::delete(20)]);
    }

    #[test]
    fn test_filter_incremental_none_match() {
        let deltas = vec![Delta::insert(1), Delta::insert(2)];
        assert!(filter_incremental(&deltas, |&x| x > 100).is_empty());
    }

    #[test]
    fn test_filter_error_drops_row() {
        let mut op = Filter {
            predicate: Arc::new(|row: &Row| match row.get(0) {
                Some(Value::Int(v)) => Ok(*v > 1),
                _ => Err(DataError::custom("not an int")),
            }),
        };
        let input = vec![
            Update::insert_row(Key(1), row![2i64]),
            Update::insert_row(Key(2), row![0i64]),
            Update::insert_row(Key(3), row!["x"]),
        ];
        let mut ctx = StepContext::new(Timestamp(1), "filter");
        let out = op.step(&mut ctx, &[&input]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key(), Key(1));
        assert_eq!(ctx.into_errors().len(), 1);
    }
}
