//! Groupby-reduce.
//!
//! [`GroupReduce`] partitions rows by the values of its grouping columns and
//! keeps one accumulator per group and reducer. Insertions are folded in with
//! `update`. Deletions call `retract`; when a reducer cannot retract, the
//! group is rebuilt from the rows it buffers for that purpose. A group whose
//! last row leaves is destroyed, and every touched group emits the deletion
//! of its previous result followed by the insertion of its new one.

mod accumulator;
mod reducers;

pub use accumulator::{Accumulator, AccumulatorState, ReducerFactory, ReducerInput};
pub use reducers::{
    AnyAcc, ArgMaxAcc, ArgMinAcc, AvgAcc, CountAcc, EarliestAcc, FloatSumAcc, IntSumAcc,
    LatestAcc, MaxAcc, MinAcc, Multiset, SortedTupleAcc, TupleAcc, UniqueAcc,
};

use crate::dataflow::{ColumnId, Dataflow, Operator, TableRef};
use crate::delta::Update;
use crate::error_log::StepContext;
use eddy_core::{DataResult, Error, Key, Result, Row, Timestamp, Value};
use hashbrown::HashMap;
use std::collections::BTreeMap;

/// A reducer kind.
#[derive(Clone, Debug)]
pub enum Reducer {
    Count,
    IntSum,
    FloatSum,
    Avg,
    Min,
    Max,
    /// Pointer to the row with the smallest value
    ArgMin,
    /// Pointer to the row with the largest value
    ArgMax,
    SortedTuple { skip_nones: bool },
    Tuple { skip_nones: bool },
    Unique,
    Any,
    /// Value of the row inserted first
    Earliest,
    /// Value of the row inserted last
    Latest,
    Custom(ReducerFactory),
}

impl Reducer {
    /// A user-defined reducer.
    pub fn custom<A: Accumulator>(name: &str) -> Self {
        Reducer::Custom(ReducerFactory::of::<A>(name))
    }

    pub fn factory(&self) -> ReducerFactory {
        match self {
            Reducer::Count => ReducerFactory::of::<CountAcc>("count"),
            Reducer::IntSum => ReducerFactory::of::<IntSumAcc>("int_sum"),
            Reducer::FloatSum => ReducerFactory::of::<FloatSumAcc>("float_sum"),
            Reducer::Avg => ReducerFactory::of::<AvgAcc>("avg"),
            Reducer::Min => ReducerFactory::of::<MinAcc>("min"),
            Reducer::Max => ReducerFactory::of::<MaxAcc>("max"),
            Reducer::ArgMin => ReducerFactory::of::<ArgMinAcc>("argmin"),
            Reducer::ArgMax => ReducerFactory::of::<ArgMaxAcc>("argmax"),
            Reducer::SortedTuple { skip_nones: true } => {
                ReducerFactory::of::<SortedTupleAcc<true>>("sorted_tuple")
            }
            Reducer::SortedTuple { skip_nones: false } => {
                ReducerFactory::of::<SortedTupleAcc<false>>("sorted_tuple")
            }
            Reducer::Tuple { skip_nones: true } => ReducerFactory::of::<TupleAcc<true>>("tuple"),
            Reducer::Tuple { skip_nones: false } => ReducerFactory::of::<TupleAcc<false>>("tuple"),
            Reducer::Unique => ReducerFactory::of::<UniqueAcc>("unique"),
            Reducer::Any => ReducerFactory::of::<AnyAcc>("any"),
            Reducer::Earliest => ReducerFactory::of::<EarliestAcc>("earliest"),
            Reducer::Latest => ReducerFactory::of::<LatestAcc>("latest"),
            Reducer::Custom(factory) => factory.clone(),
        }
    }

    /// Applies the reducer to the given argument columns.
    pub fn on(self, args: &[ColumnId]) -> ReducerSpec {
        ReducerSpec {
            reducer: self,
            args: args.to_vec(),
        }
    }

    fn needs_argument(&self) -> bool {
        !matches!(self, Reducer::Count | Reducer::Custom(_))
    }
}

/// A reducer together with its argument columns.
#[derive(Clone, Debug)]
pub struct ReducerSpec {
    pub reducer: Reducer,
    pub args: Vec<ColumnId>,
}

impl ReducerSpec {
    pub fn count() -> Self {
        Reducer::Count.on(&[])
    }

    fn validate(&self, table: &TableRef) -> Result<()> {
        table.check_columns(&self.args)?;
        if self.reducer.needs_argument() && self.args.is_empty() {
            return Err(Error::invalid_operation(format!(
                "reducer {} needs an argument column",
                self.reducer.factory().name()
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BoundReducer {
    factory: ReducerFactory,
    args: Vec<ColumnId>,
}

struct GroupState {
    values: Vec<Value>,
    count: i64,
    states: Vec<Option<Box<dyn AccumulatorState>>>,
    errors: Vec<i64>,
    times: HashMap<Key, Timestamp>,
    members: HashMap<Key, Row>,
}

impl GroupState {
    fn new(values: Vec<Value>, reducers: usize) -> Self {
        Self {
            values,
            count: 0,
            states: (0..reducers).map(|_| None).collect(),
            errors: vec![0; reducers],
            times: HashMap::new(),
            members: HashMap::new(),
        }
    }

    fn contribute(
        &mut self,
        i: usize,
        reducer: &BoundReducer,
        key: Key,
        row: &Row,
        time: Timestamp,
    ) -> DataResult<()> {
        let values = row.extract(&reducer.args);
        if values.iter().any(Value::is_error) {
            self.errors[i] += 1;
            return Ok(());
        }
        let state = reducer.factory.make(&ReducerInput { key, values: &values, time });
        match state {
            Ok(state) => {
                match &mut self.states[i] {
                    Some(current) => current.update_boxed(state),
                    slot @ None => *slot = Some(state),
                }
                Ok(())
            }
            Err(err) => {
                self.errors[i] += 1;
                Err(err)
            }
        }
    }

    fn insert(
        &mut self,
        reducers: &[BoundReducer],
        keep_members: bool,
        ctx: &mut StepContext,
        key: Key,
        row: &Row,
    ) {
        let time = ctx.time();
        self.count += 1;
        self.times.insert(key, time);
        if keep_members {
            self.members.insert(key, row.clone());
        }
        for (i, reducer) in reducers.iter().enumerate() {
            if let Err(err) = self.contribute(i, reducer, key, row, time) {
                ctx.report(Some(key), &err);
            }
        }
    }

    fn retract(&mut self, reducers: &[BoundReducer], key: Key, row: &Row, stale: &mut [bool]) {
        let time = self.times.remove(&key).unwrap_or_default();
        self.count -= 1;
        self.members.remove(&key);
        for (i, reducer) in reducers.iter().enumerate() {
            if stale[i] {
                continue;
            }
            let values = row.extract(&reducer.args);
            if values.iter().any(Value::is_error) {
                self.errors[i] -= 1;
                continue;
            }
            match reducer.factory.make(&ReducerInput { key, values: &values, time }) {
                Err(_) => self.errors[i] -= 1,
                Ok(state) => {
                    let retracted = reducer.factory.is_retractable()
                        && self.states[i]
                            .as_mut()
                            .is_some_and(|current| current.retract_boxed(state));
                    if !retracted {
                        stale[i] = true;
                    }
                }
            }
        }
    }

    /// Recomputes one reducer from the buffered rows.
    fn rebuild(&mut self, i: usize, reducer: &BoundReducer) {
        self.states[i] = None;
        self.errors[i] = 0;
        let mut members: Vec<(Key, Row)> =
            self.members.iter().map(|(k, r)| (*k, r.clone())).collect();
        members.sort_by_key(|(k, _)| *k);
        for (key, row) in members {
            let time = self.times.get(&key).copied().unwrap_or_default();
            // Errors were reported when the rows were inserted
            let _ = self.contribute(i, reducer, key, &row, time);
        }
    }

    fn result_row(&self, reducers: &[BoundReducer], ctx: &mut StepContext, key: Key) -> Row {
        let mut values = self.values.clone();
        for (i, reducer) in reducers.iter().enumerate() {
            let value = if self.errors[i] > 0 {
                Value::Error
            } else {
                match &self.states[i] {
                    Some(state) => state.try_result().unwrap_or_else(|err| {
                        ctx.report(Some(key), &err);
                        Value::Error
                    }),
                    None => neutral_value(reducer),
                }
            };
            values.push(value);
        }
        Row::new(values)
    }
}

fn neutral_value(reducer: &BoundReducer) -> Value {
    reducer
        .factory
        .neutral()
        .map(|state| state.result())
        .unwrap_or(Value::Null)
}

/// Incremental groupby-reduce operator.
pub struct GroupReduce {
    group_by: Vec<ColumnId>,
    reducers: Vec<BoundReducer>,
    keep_members: bool,
    global: bool,
    started: bool,
    groups: HashMap<Key, GroupState>,
    outputs: HashMap<Key, Row>,
}

impl GroupReduce {
    /// Creates the operator. A `global` reduce has a single group and shows
    /// neutral results while its input is empty.
    pub fn new(group_by: Vec<ColumnId>, specs: Vec<ReducerSpec>, global: bool) -> Self {
        let keep_members = specs.iter().any(|spec| {
            matches!(spec.reducer, Reducer::Custom(_)) || !spec.reducer.factory().is_retractable()
        });
        let reducers = specs
            .into_iter()
            .map(|spec| BoundReducer {
                factory: spec.reducer.factory(),
                args: spec.args,
            })
            .collect();
        Self {
            group_by,
            reducers,
            keep_members,
            global,
            started: false,
            groups: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    /// Number of live groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Drops every group whose grouping values match `closed`.
    ///
    /// Returns the last emitted result of each dropped group, in key order.
    pub fn evict_where<F>(&mut self, mut closed: F) -> Vec<(Key, Row)>
    where
        F: FnMut(&[Value]) -> bool,
    {
        let keys: Vec<Key> = self
            .groups
            .iter()
            .filter(|(_, group)| closed(&group.values))
            .map(|(key, _)| *key)
            .collect();
        let mut evicted = Vec::with_capacity(keys.len());
        for key in keys {
            self.groups.remove(&key);
            if let Some(row) = self.outputs.remove(&key) {
                evicted.push((key, row));
            }
        }
        evicted.sort_by_key(|(key, _)| *key);
        evicted
    }

    fn neutral_row(&self) -> Row {
        Row::new(self.reducers.iter().map(neutral_value).collect())
    }
}

type Touched<'a> = BTreeMap<Key, (Vec<Value>, Vec<&'a Update>, Vec<&'a Update>)>;

impl Operator for GroupReduce {
    fn name(&self) -> &str {
        "groupby_reduce"
    }

    fn step(&mut self, ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let mut touched: Touched<'_> = BTreeMap::new();
        for update in inputs[0] {
            let values = update.row().extract(&self.group_by);
            let group_key = Key::for_values(&values);
            let entry = touched
                .entry(group_key)
                .or_insert_with(|| (values, Vec::new(), Vec::new()));
            if update.is_delete() {
                entry.1.push(update);
            } else {
                entry.2.push(update);
            }
        }
        if self.global && !self.started {
            touched
                .entry(Key::for_values(&[]))
                .or_insert_with(|| (Vec::new(), Vec::new(), Vec::new()));
        }
        self.started = true;

        let mut out = Vec::new();
        for (group_key, (values, deletes, inserts)) in touched {
            let old = self.outputs.get(&group_key).cloned();
            let n = self.reducers.len();
            let group = self
                .groups
                .entry(group_key)
                .or_insert_with(|| GroupState::new(values, n));

            let mut stale = vec![false; n];
            for update in deletes {
                for _ in 0..update.diff.unsigned_abs() {
                    group.retract(&self.reducers, update.key(), update.row(), &mut stale);
                }
            }
            for update in inserts {
                for _ in 0..update.diff {
                    group.insert(&self.reducers, self.keep_members, ctx, update.key(), update.row());
                }
            }

            let new = if group.count <= 0 {
                if group.count < 0 {
                    return Err(Error::MultiplicityViolation {
                        key: group_key,
                        count: group.count,
                    });
                }
                self.groups.remove(&group_key);
                self.global.then(|| self.neutral_row())
            } else {
                for (i, reducer) in self.reducers.iter().enumerate() {
                    if stale[i] {
                        group.rebuild(i, reducer);
                    }
                }
                Some(group.result_row(&self.reducers, ctx, group_key))
            };

            if old != new {
                if let Some(old) = old {
                    out.push(Update::delete_row(group_key, old));
                }
                match new {
                    Some(new) => {
                        out.push(Update::insert_row(group_key, new.clone()));
                        self.outputs.insert(group_key, new);
                    }
                    None => {
                        self.outputs.remove(&group_key);
                    }
                }
            }
        }
        Ok(out)
    }

    fn wants_idle_steps(&self) -> bool {
        self.global && !self.started
    }
}

impl Dataflow {
    /// Groups rows by `group_by` and reduces each group.
    ///
    /// Output rows hold the grouping values followed by one column per
    /// reducer and are keyed by `Key::for_values` of the grouping values.
    pub fn groupby_reduce(
        &mut self,
        table: TableRef,
        group_by: &[ColumnId],
        reducers: Vec<ReducerSpec>,
    ) -> Result<TableRef> {
        table.check_columns(group_by)?;
        for spec in &reducers {
            spec.validate(&table)?;
        }
        let arity = group_by.len() + reducers.len();
        self.add_operator(
            &[table],
            arity,
            GroupReduce::new(group_by.to_vec(), reducers, false),
        )
    }

    /// Reduces the whole table to a single row.
    pub fn reduce(&mut self, table: TableRef, reducers: Vec<ReducerSpec>) -> Result<TableRef> {
        for spec in &reducers {
            spec.validate(&table)?;
        }
        let arity = reducers.len();
        self.add_operator(&[table], arity, GroupReduce::new(Vec::new(), reducers, true))
    }
}
