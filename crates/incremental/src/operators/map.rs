//! Row-local operators: select, fill_error, reindex and flatten.

use crate::dataflow::{ColumnId, Dataflow, Operator, TableRef};
use crate::delta::{Delta, Update};
use crate::error_log::StepContext;
use crate::operators::expr::Expr;
use eddy_core::{DataError, Error, Key, Result, Row, Value};
use hashbrown::HashMap;

/// Applies a mapper function to a batch of deltas.
///
/// The diff values are preserved.
pub fn map_incremental<T, U, F>(input: &[Delta<T>], mut mapper: F) -> Vec<Delta<U>>
where
    F: FnMut(&T) -> U,
{
    input
        .iter()
        .map(|d| Delta::new(mapper(&d.data), d.diff))
        .collect()
}

/// Evaluates expressions per row; the key set is unchanged.
pub struct Select {
    exprs: Vec<Expr>,
}

impl Select {
    pub fn new(exprs: Vec<Expr>) -> Self {
        Self { exprs }
    }
}

impl Operator for Select {
    fn name(&self) -> &str {
        "select"
    }

    fn step(&mut self, ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let mut out = Vec::with_capacity(inputs[0].len());
        for update in inputs[0] {
            let values = self
                .exprs
                .iter()
                .map(|expr| match expr.eval(update.row()) {
                    Ok(v) => v,
                    Err(err) => {
                        // Retractions re-evaluate the same row; report once
                        if update.is_insert() {
                            ctx.report(Some(update.key()), &err);
                        }
                        Value::Error
                    }
                })
                .collect();
            out.push(Delta::new((update.key(), values), update.diff));
        }
        Ok(out)
    }
}

/// Replaces error cells with a fixed value.
pub struct FillError {
    replacement: Value,
}

impl Operator for FillError {
    fn name(&self) -> &str {
        "fill_error"
    }

    fn step(&mut self, _ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        Ok(map_incremental(inputs[0], |(key, row)| {
            let row = if row.contains_error() {
                row.iter()
                    .map(|v| if v.is_error() { self.replacement.clone() } else { v.clone() })
                    .collect()
            } else {
                row.clone()
            };
            (*key, row)
        }))
    }
}

/// Re-keys rows by the values of some columns.
pub struct Reindex {
    columns: Vec<ColumnId>,
    counts: HashMap<Key, i64>,
}

impl Operator for Reindex {
    fn name(&self) -> &str {
        "reindex"
    }

    fn step(&mut self, _ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let output = map_incremental(inputs[0], |(_, row)| {
            (Key::for_values(&row.extract(&self.columns)), row.clone())
        });
        for update in &output {
            *self.counts.entry(update.key()).or_insert(0) += update.diff as i64;
        }
        for update in &output {
            match self.counts.get(&update.key()).copied() {
                Some(c) if c > 1 => {
                    return Err(Error::DuplicateKey {
                        operator: "reindex".into(),
                        key: update.key(),
                    })
                }
                Some(0) => {
                    self.counts.remove(&update.key());
                }
                _ => {}
            }
        }
        Ok(output)
    }
}

/// Emits one row per element of a tuple column.
pub struct Flatten {
    column: ColumnId,
}

impl Flatten {
    fn expand(&self, ctx: &mut StepContext, key: Key, row: &Row, diff: i32, out: &mut Vec<Update>) {
        let replace = |value: Value| {
            let mut values = row.to_vec();
            values[self.column] = value;
            Row::new(values)
        };
        match row.get(self.column) {
            Some(Value::Tuple(items)) => {
                for (i, item) in items.iter().enumerate() {
                    let key = key.with_salt(&Value::Int(i as i64));
                    out.push(Delta::new((key, replace(item.clone())), diff));
                }
            }
            Some(Value::Null) | None => {}
            Some(other) => {
                if diff > 0 {
                    ctx.report(Some(key), &DataError::custom(format!("cannot flatten {other}")));
                }
                let key = key.with_salt(&Value::Int(0));
                out.push(Delta::new((key, replace(Value::Error)), diff));
            }
        }
    }
}

impl Operator for Flatten {
    fn name(&self) -> &str {
        "flatten"
    }

    fn step(&mut self, ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let mut out = Vec::new();
        for update in inputs[0] {
            self.expand(ctx, update.key(), update.row(), update.diff, &mut out);
        }
        Ok(out)
    }
}

impl Dataflow {
    /// Computes one output column per expression. Keys are preserved.
    ///
    /// A failing expression yields `Value::Error` in its cell and an error
    /// log entry; the row is kept.
    pub fn select(&mut self, table: TableRef, exprs: Vec<Expr>) -> Result<TableRef> {
        let arity = exprs.len();
        self.add_operator(&[table], arity, Select::new(exprs))
    }

    /// Keeps the given columns, in the given order.
    pub fn project(&mut self, table: TableRef, columns: &[ColumnId]) -> Result<TableRef> {
        table.check_columns(columns)?;
        self.select(table, columns.iter().map(|&c| Expr::col(c)).collect())
    }

    /// Replaces every `Value::Error` cell with `replacement`.
    pub fn fill_error(&mut self, table: TableRef, replacement: impl Into<Value>) -> Result<TableRef> {
        self.add_operator(
            &[table],
            table.arity,
            FillError {
                replacement: replacement.into(),
            },
        )
    }

    /// Re-keys rows by the given columns. Two live rows with equal values are
    /// a hard error.
    pub fn reindex(&mut self, table: TableRef, columns: &[ColumnId]) -> Result<TableRef> {
        table.check_columns(columns)?;
        self.add_operator(
            &[table],
            table.arity,
            Reindex {
                columns: columns.to_vec(),
                counts: HashMap::new(),
            },
        )
    }

    /// Emits one row per element of the tuple in `column`.
    pub fn flatten(&mut self, table: TableRef, column: ColumnId) -> Result<TableRef> {
        table.check_column(column)?;
        self.add_operator(&[table], table.arity, Flatten { column })
    }
}
