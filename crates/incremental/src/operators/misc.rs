//! Table unions and deduplication.

use crate::dataflow::{ColumnId, Dataflow, Operator, TableRef};
use crate::delta::Update;
use crate::error_log::StepContext;
use eddy_core::{Error, Key, Result, Row, Value};
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Union of tables with disjoint keys.
pub struct Concat {
    counts: HashMap<Key, i64>,
}

impl Operator for Concat {
    fn name(&self) -> &str {
        "concat"
    }

    fn step(&mut self, _ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let out: Vec<Update> = inputs.iter().flat_map(|updates| updates.iter().cloned()).collect();
        for update in &out {
            *self.counts.entry(update.key()).or_insert(0) += update.diff as i64;
        }
        for update in &out {
            match self.counts.get(&update.key()).copied() {
                Some(count) if count > 1 => {
                    return Err(Error::DuplicateKey {
                        operator: "concat".into(),
                        key: update.key(),
                    })
                }
                Some(0) => {
                    self.counts.remove(&update.key());
                }
                _ => {}
            }
        }
        Ok(out)
    }
}

/// Decides whether a new value replaces the current one of its instance.
/// Receives `(new, current)`.
pub type Acceptor = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// Keeps, per instance, the last row whose value was accepted.
///
/// Only insertions are considered. The first row of an instance is always
/// accepted.
pub struct Deduplicate {
    value_column: ColumnId,
    instance: Vec<ColumnId>,
    acceptor: Acceptor,
    current: HashMap<Key, Row>,
}

impl Operator for Deduplicate {
    fn name(&self) -> &str {
        "deduplicate"
    }

    fn step(&mut self, _ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let mut inserts: Vec<&Update> = inputs[0].iter().filter(|u| u.is_insert()).collect();
        inserts.sort_by_key(|u| u.key());
        // Row each touched instance had before this batch
        let mut touched: BTreeMap<Key, Option<Row>> = BTreeMap::new();
        for update in inserts {
            let row = update.row();
            let key = Key::for_values(&row.extract(&self.instance));
            let value = row.get_or_null(self.value_column);
            let accepted = match self.current.get(&key) {
                Some(current) => (self.acceptor)(&value, &current.get_or_null(self.value_column)),
                None => true,
            };
            if accepted {
                let previous = self.current.insert(key, row.clone());
                touched.entry(key).or_insert(previous);
            }
        }
        let mut out = Vec::new();
        for (key, previous) in touched {
            let Some(current) = self.current.get(&key) else {
                continue;
            };
            match previous {
                Some(previous) if previous == *current => continue,
                Some(previous) => out.push(Update::delete_row(key, previous)),
                None => {}
            }
            out.push(Update::insert_row(key, current.clone()));
        }
        Ok(out)
    }
}

impl Dataflow {
    /// Unions tables of equal arity. A key present in two inputs at once
    /// fails the batch with [`Error::DuplicateKey`].
    pub fn concat(&mut self, tables: &[TableRef]) -> Result<TableRef> {
        let Some(first) = tables.first() else {
            return Err(Error::invalid_operation("concat needs at least one table"));
        };
        if let Some(other) = tables.iter().find(|t| t.arity != first.arity) {
            return Err(Error::invalid_operation(format!(
                "concat of tables with {} and {} columns",
                first.arity, other.arity
            )));
        }
        self.add_operator(
            tables,
            first.arity,
            Concat {
                counts: HashMap::new(),
            },
        )
    }

    /// Keeps one row per value of the `instance` columns: the latest row
    /// whose `value_column` the acceptor took over the current one.
    pub fn deduplicate<F>(
        &mut self,
        table: TableRef,
        value_column: ColumnId,
        instance: &[ColumnId],
        acceptor: F,
    ) -> Result<TableRef>
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        table.check_column(value_column)?;
        table.check_columns(instance)?;
        self.add_operator(
            &[table],
            table.arity,
            Deduplicate {
                value_column,
                instance: instance.to_vec(),
                acceptor: Arc::new(acceptor),
                current: HashMap::new(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::{row, Timestamp};

    fn step(op: &mut dyn Operator, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let mut ctx = StepContext::new(Timestamp(1), op.name().to_string());
        op.step(&mut ctx, inputs)
    }

    #[test]
    fn test_concat_disjoint() {
        let mut op = Concat {
            counts: HashMap::new(),
        };
        let a = vec![Update::insert_row(Key(1), row![1i64])];
        let b = vec![Update::insert_row(Key(2), row![2i64])];
        assert_eq!(step(&mut op, &[&a, &b]).unwrap().len(), 2);

        // A key may move from one input to the other within a batch
        let a = vec![Update::delete_row(Key(1), row![1i64])];
        let b = vec![Update::insert_row(Key(1), row![3i64])];
        assert!(step(&mut op, &[&a, &b]).is_ok());
    }

    #[test]
    fn test_concat_duplicate_key() {
        let mut op = Concat {
            counts: HashMap::new(),
        };
        let a = vec![Update::insert_row(Key(1), row![1i64])];
        let b = vec![Update::insert_row(Key(1), row![2i64])];
        assert!(matches!(
            step(&mut op, &[&a, &b]),
            Err(Error::DuplicateKey { .. })
        ));
    }

    fn dedup() -> Deduplicate {
        // Accept only strictly larger readings
        Deduplicate {
            value_column: 1,
            instance: vec![0],
            acceptor: Arc::new(|new, current| new > current),
            current: HashMap::new(),
        }
    }

    #[test]
    fn test_deduplicate_keeps_accepted() {
        let mut op = dedup();
        let sensor = Key::for_values(&["a".into()]);
        let batch = vec![
            Update::insert_row(Key(1), row!["a", 5i64]),
            Update::insert_row(Key(2), row!["a", 3i64]),
        ];
        let out = step(&mut op, &[&batch]).unwrap();
        assert_eq!(out, vec![Update::insert_row(sensor, row!["a", 5i64])]);

        let batch = vec![Update::insert_row(Key(3), row!["a", 9i64])];
        let out = step(&mut op, &[&batch]).unwrap();
        assert_eq!(
            out,
            vec![
                Update::delete_row(sensor, row!["a", 5i64]),
                Update::insert_row(sensor, row!["a", 9i64]),
            ]
        );

        // Deletions are ignored
        let batch = vec![Update::delete_row(Key(3), row!["a", 9i64])];
        let out = step(&mut op, &[&batch]).unwrap();
        assert!(out.is_empty());
    }
}
