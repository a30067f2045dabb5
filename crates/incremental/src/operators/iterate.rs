//! Fixed-point iteration.
//!
//! The body of an iteration is a function building a nested dataflow over
//! placeholder inputs. Whenever an input of the iteration changes, the nested
//! dataflow is built afresh, seeded with the full current state, and run
//! round after round. Each round feeds back only the rows the previous round
//! changed, until a round changes nothing.
//!
//! The iteration node emits all its result tables as one stream, every row
//! prefixed with the index of its table. One split node per result strips the
//! prefix again.

use crate::collection::KeyedTable;
use crate::dataflow::{Dataflow, Operator, TableRef};
use crate::delta::{Delta, Update};
use crate::error_log::StepContext;
use crate::executor::Executor;
use eddy_core::{Error, Key, Result, Row, Timestamp, Value};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds the body of an iteration: receives the iterated tables and the
/// auxiliary tables, returns the next state of every iterated table.
pub type IterateBody =
    dyn Fn(&mut Dataflow, &[TableRef], &[TableRef]) -> Result<Vec<TableRef>> + Send + Sync;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterateOptions {
    /// Maximum number of body applications per batch
    pub limit: Option<usize>,
    /// Emit the state reached at the limit instead of failing
    pub stop_at_limit: bool,
    /// Whether the body may add or remove keys of the iterated tables
    pub allow_key_growth: bool,
}

impl IterateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn stop_at_limit(mut self, stop: bool) -> Self {
        self.stop_at_limit = stop;
        self
    }

    pub fn allow_key_growth(mut self, allow: bool) -> Self {
        self.allow_key_growth = allow;
        self
    }
}

fn iterated_name(index: usize) -> String {
    format!("iterated_{index}")
}

fn aux_name(index: usize) -> String {
    format!("aux_{index}")
}

fn result_name(index: usize) -> String {
    format!("result_{index}")
}

/// Builds the nested dataflow and checks that the body returns one table of
/// matching arity per iterated table.
fn build(body: &IterateBody, arities: &[usize], aux_arities: &[usize]) -> Result<Dataflow> {
    let mut inner = Dataflow::new();
    let tables = arities
        .iter()
        .enumerate()
        .map(|(i, &arity)| inner.input(iterated_name(i), arity))
        .collect::<Result<Vec<_>>>()?;
    let aux = aux_arities
        .iter()
        .enumerate()
        .map(|(i, &arity)| inner.input(aux_name(i), arity))
        .collect::<Result<Vec<_>>>()?;
    let results = body(&mut inner, &tables, &aux)?;
    if results.len() != tables.len() {
        return Err(Error::invalid_operation(format!(
            "iteration body returned {} tables for {} iterated tables",
            results.len(),
            tables.len()
        )));
    }
    for (i, (result, table)) in results.iter().zip(&tables).enumerate() {
        if result.arity != table.arity {
            return Err(Error::invalid_operation(format!(
                "iteration body changed the arity of table {i} from {} to {}",
                table.arity, result.arity
            )));
        }
        inner.output(result_name(i), *result)?;
    }
    Ok(inner)
}

/// Whether a round's changes add or remove keys.
fn changes_key_set(delta: &[Update]) -> bool {
    let mut net: HashMap<Key, i64> = HashMap::new();
    for update in delta {
        *net.entry(update.key()).or_insert(0) += update.diff as i64;
    }
    net.values().any(|&n| n != 0)
}

/// Iteration operator.
pub struct Iterate {
    body: Arc<IterateBody>,
    options: IterateOptions,
    arities: Vec<usize>,
    aux_arities: Vec<usize>,
    /// State of the iterated inputs followed by the auxiliary inputs
    inputs: Vec<KeyedTable>,
    emitted: Vec<KeyedTable>,
    rounds: usize,
}

impl Iterate {
    /// Rounds needed by the last batch.
    #[inline]
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    fn solve(&mut self, ctx: &mut StepContext) -> Result<Vec<KeyedTable>> {
        let n = self.arities.len();
        let mut exec = Executor::new(build(&*self.body, &self.arities, &self.aux_arities)?);
        let mut current: Vec<KeyedTable> = self.inputs[..n].to_vec();
        let mut feed: HashMap<String, Vec<Update>> = HashMap::new();
        for (i, table) in self.inputs.iter().enumerate() {
            let name = if i < n { iterated_name(i) } else { aux_name(i - n) };
            feed.insert(name, table.as_inserts());
        }

        let mut round = 0;
        loop {
            round += 1;
            let output = exec.run_batch(Timestamp(round as u64), std::mem::take(&mut feed))?;
            ctx.absorb(exec.error_log_mut().drain());
            let mut changed = false;
            for (i, state) in current.iter_mut().enumerate() {
                let name = result_name(i);
                // The first round's output is a full table, later ones are
                // differences against the previous round
                let delta = if round == 1 {
                    match exec.output_snapshot(&name) {
                        Some(next) => state.diff_to(next),
                        None => Vec::new(),
                    }
                } else {
                    output.get(&name).to_vec()
                };
                if delta.is_empty() {
                    continue;
                }
                if !self.options.allow_key_growth && changes_key_set(&delta) {
                    return Err(Error::IterationKeySetChanged { table: i });
                }
                state.apply_unchecked(&delta);
                feed.insert(iterated_name(i), delta);
                changed = true;
            }
            if !changed {
                break;
            }
            if let Some(limit) = self.options.limit {
                if round >= limit {
                    if !self.options.stop_at_limit {
                        return Err(Error::IterationLimit { limit });
                    }
                    warn!(limit, "iteration stopped at its limit before converging");
                    break;
                }
            }
        }
        debug!(rounds = round, "iteration finished");
        self.rounds = round;
        Ok(current)
    }
}

fn tag(index: usize, update: Update) -> Update {
    update.map(|(key, row)| {
        let values = std::iter::once(Value::Int(index as i64))
            .chain(row.iter().cloned())
            .collect();
        (key, Row::new(values))
    })
}

impl Operator for Iterate {
    fn name(&self) -> &str {
        "iterate"
    }

    fn step(&mut self, ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        if inputs.iter().all(|updates| updates.is_empty()) {
            return Ok(Vec::new());
        }
        for (table, updates) in self.inputs.iter_mut().zip(inputs) {
            table.apply_batch(updates)?;
        }
        let results = self.solve(ctx)?;
        let mut out = Vec::new();
        for (i, (emitted, result)) in self.emitted.iter_mut().zip(results).enumerate() {
            out.extend(emitted.diff_to(&result).into_iter().map(|u| tag(i, u)));
            *emitted = result;
        }
        Ok(out)
    }
}

/// Picks the rows of one result table out of the iteration stream.
struct Split {
    index: i64,
}

impl Operator for Split {
    fn name(&self) -> &str {
        "iterate_split"
    }

    fn step(&mut self, _ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        Ok(inputs[0]
            .iter()
            .filter(|u| u.row().get(0) == Some(&Value::Int(self.index)))
            .map(|u| Delta::new((u.key(), Row::new(u.row()[1..].to_vec())), u.diff))
            .collect())
    }
}

impl Dataflow {
    /// Applies `body` to `tables` until a fixed point is reached and returns
    /// the final state of every iterated table.
    ///
    /// `aux` tables are visible to the body but not iterated. Unless
    /// `allow_key_growth` is set, the body must keep the key set of each
    /// iterated table.
    pub fn iterate<F>(
        &mut self,
        tables: &[TableRef],
        aux: &[TableRef],
        options: IterateOptions,
        body: F,
    ) -> Result<Vec<TableRef>>
    where
        F: Fn(&mut Dataflow, &[TableRef], &[TableRef]) -> Result<Vec<TableRef>> + Send + Sync + 'static,
    {
        if tables.is_empty() {
            return Err(Error::invalid_operation("iterate needs at least one table"));
        }
        let body: Arc<IterateBody> = Arc::new(body);
        let arities: Vec<usize> = tables.iter().map(|t| t.arity).collect();
        let aux_arities: Vec<usize> = aux.iter().map(|t| t.arity).collect();
        build(&*body, &arities, &aux_arities)?;

        let mut all = tables.to_vec();
        all.extend_from_slice(aux);
        let width = arities.iter().copied().max().unwrap_or(0) + 1;
        let op = Iterate {
            body,
            options,
            inputs: vec![KeyedTable::new(); all.len()],
            emitted: vec![KeyedTable::new(); arities.len()],
            arities: arities.clone(),
            aux_arities,
            rounds: 0,
        };
        let node = self.add_operator(&all, width, op)?;
        arities
            .iter()
            .enumerate()
            .map(|(i, &arity)| self.add_operator(&[node], arity, Split { index: i as i64 }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::Expr;
    use eddy_core::row;

    fn collatz(value: &Value) -> Value {
        match value.as_int() {
            Some(1) => Value::Int(1),
            Some(n) if n % 2 == 0 => Value::Int(n / 2),
            Some(n) => Value::Int(3 * n + 1),
            None => Value::Error,
        }
    }

    fn run(exec: &mut Executor, time: u64, rows: Vec<Update>) -> Result<Vec<Update>> {
        let mut inputs = HashMap::new();
        inputs.insert("numbers".to_string(), rows);
        let mut output = exec.run_batch(Timestamp(time), inputs)?;
        Ok(output.tables.remove("out").unwrap_or_default())
    }

    fn start(n: i64) -> Update {
        Update::insert_row(Key::for_values(&[n.into()]), row![n, n])
    }

    fn collatz_flow(options: IterateOptions) -> Executor {
        let mut df = Dataflow::new();
        let numbers = df.input("numbers", 2).unwrap();
        let result = df
            .iterate(&[numbers], &[], options, |inner, tables, _| {
                let next = inner.select(tables[0], vec![Expr::col(0), Expr::map_col(1, collatz)])?;
                Ok(vec![next])
            })
            .unwrap();
        df.output("out", result[0]).unwrap();
        Executor::new(df)
    }

    #[test]
    fn test_collatz_reaches_one() {
        let mut exec = collatz_flow(IterateOptions::new());
        let out = run(&mut exec, 1, vec![start(3), start(13), start(42)]).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|u| u.is_insert() && u.row().get(1) == Some(&Value::Int(1))));

        // A new start value only adds its own result
        let out = run(&mut exec, 2, vec![start(7)]).unwrap();
        assert_eq!(out, vec![Update::insert_row(Key::for_values(&[7i64.into()]), row![7i64, 1i64])]);
    }

    #[test]
    fn test_limit() {
        let mut exec = collatz_flow(IterateOptions::new().with_limit(3));
        assert!(matches!(
            run(&mut exec, 1, vec![start(42)]),
            Err(Error::IterationLimit { limit: 3 })
        ));

        let mut exec = collatz_flow(IterateOptions::new().with_limit(3).stop_at_limit(true));
        let out = run(&mut exec, 1, vec![start(42)]).unwrap();
        // 42 -> 21 -> 64 -> 32
        assert_eq!(out[0].row(), &row![42i64, 32i64]);
    }

    fn rekey_flow(options: IterateOptions) -> Executor {
        let mut df = Dataflow::new();
        let numbers = df.input("numbers", 2).unwrap();
        let result = df
            .iterate(&[numbers], &[], options, |inner, tables, _| {
                Ok(vec![inner.reindex(tables[0], &[1])?])
            })
            .unwrap();
        df.output("out", result[0]).unwrap();
        Executor::new(df)
    }

    #[test]
    fn test_key_set_must_hold() {
        let mut exec = rekey_flow(IterateOptions::new());
        let rows = vec![Update::insert_row(Key(77), row![1i64, 5i64])];
        assert!(matches!(
            run(&mut exec, 1, rows),
            Err(Error::IterationKeySetChanged { table: 0 })
        ));

        let mut exec = rekey_flow(IterateOptions::new().allow_key_growth(true));
        let out = run(&mut exec, 1, vec![Update::insert_row(Key(77), row![1i64, 5i64])]).unwrap();
        assert_eq!(out, vec![Update::insert_row(Key::for_values(&[5i64.into()]), row![1i64, 5i64])]);
    }

    #[test]
    fn test_body_arity_checked() {
        let mut df = Dataflow::new();
        let numbers = df.input("numbers", 2).unwrap();
        let result = df.iterate(&[numbers], &[], IterateOptions::new(), |inner, tables, _| {
            Ok(vec![inner.project(tables[0], &[0])?])
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_aux_tables_are_visible() {
        let mut df = Dataflow::new();
        let numbers = df.input("numbers", 2).unwrap();
        let caps = df.input("caps", 1).unwrap();
        let result = df
            .iterate(&[numbers], &[caps], IterateOptions::new(), |inner, tables, aux| {
                // Halve until the value drops below every cap
                let joined = inner.join(tables[0], aux[0], &[], crate::operators::JoinType::Left)?;
                let next = inner.select(
                    joined,
                    vec![
                        Expr::col(0),
                        Expr::new(|row| {
                            let n = row[1].as_int().unwrap_or(0);
                            Ok(match row[2].as_int() {
                                Some(cap) if n >= cap => Value::Int(n / 2),
                                _ => Value::Int(n),
                            })
                        }),
                    ],
                )?;
                Ok(vec![inner.reindex(next, &[0])?])
            })
            .unwrap();
        df.output("out", result[0]).unwrap();
        let mut exec = Executor::new(df);
        let mut inputs = HashMap::new();
        inputs.insert("numbers".to_string(), vec![start(40)]);
        inputs.insert("caps".to_string(), vec![Update::insert_row(Key(1), row![6i64])]);
        let output = exec.run_batch(Timestamp(1), inputs).unwrap();
        assert_eq!(output.get("out")[0].row(), &row![40i64, 5i64]);
    }
}
