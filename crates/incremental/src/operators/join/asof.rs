//! Asof join: every left row is paired with the single closest right row in
//! time.

use super::{admit, split_on};
use crate::dataflow::{ColumnId, Dataflow, Operator, TableRef};
use crate::delta::Update;
use crate::error_log::StepContext;
use crate::operators::temporal::{TemporalBehavior, TemporalGate};
use eddy_core::{Error, Key, Result, Row, Value};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Which right row a left row at `t_l` picks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AsofDirection {
    /// Largest `t_r <= t_l`
    #[default]
    Backward,
    /// Smallest `t_r >= t_l`
    Forward,
    /// Smallest `|t_r - t_l|`, backward on ties
    Nearest,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AsofJoinType {
    /// Left rows without a partner are dropped.
    #[default]
    Inner,
    /// Left rows without a partner are padded with the defaults.
    Left,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AsofOptions {
    pub direction: AsofDirection,
    pub join_type: AsofJoinType,
    /// Values for right columns of unmatched left rows. Other columns are null.
    pub defaults: Vec<(ColumnId, Value)>,
}

impl AsofOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn direction(mut self, direction: AsofDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn join_type(mut self, join_type: AsofJoinType) -> Self {
        self.join_type = join_type;
        self
    }

    pub fn with_default(mut self, column: ColumnId, value: impl Into<Value>) -> Self {
        self.defaults.push((column, value.into()));
        self
    }
}

type Slot = (i64, Key);

#[derive(Debug, Default)]
struct Group {
    left: BTreeMap<Slot, Row>,
    right: BTreeMap<Slot, Row>,
}

impl Group {
    fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }

    /// Latest right row at or before `time`. Equal times pick the largest key.
    fn backward(&self, time: i64) -> Option<(i64, &Row)> {
        self.right
            .range(..=(time, Key(u128::MAX)))
            .next_back()
            .map(|(&(t, _), row)| (t, row))
    }

    /// Earliest right row at or after `time`. Equal times pick the largest key.
    fn forward(&self, time: i64) -> Option<(i64, &Row)> {
        let (&(first, _), _) = self.right.range((time, Key(0))..).next()?;
        self.right
            .range((first, Key(0))..=(first, Key(u128::MAX)))
            .next_back()
            .map(|(&(t, _), row)| (t, row))
    }

    fn partner(&self, direction: AsofDirection, time: i64) -> Option<&Row> {
        match direction {
            AsofDirection::Backward => self.backward(time).map(|(_, row)| row),
            AsofDirection::Forward => self.forward(time).map(|(_, row)| row),
            AsofDirection::Nearest => match (self.backward(time), self.forward(time)) {
                (Some((bt, before)), Some((ft, after))) => {
                    let back = i128::from(time) - i128::from(bt);
                    let ahead = i128::from(ft) - i128::from(time);
                    Some(if back <= ahead { before } else { after })
                }
                (before, after) => before.or(after).map(|(_, row)| row),
            },
        }
    }

    /// Left slots whose partner may change when a right row at `time` comes
    /// or goes.
    fn affected(&self, time: i64) -> Vec<Key> {
        let prev = self
            .right
            .range(..(time, Key(0)))
            .next_back()
            .map_or(i64::MIN, |(&(t, _), _)| t);
        let next = self
            .right
            .range((Bound::Excluded((time, Key(u128::MAX))), Bound::Unbounded))
            .next()
            .map_or(i64::MAX, |(&(t, _), _)| t);
        self.left
            .range((prev, Key(0))..=(next, Key(u128::MAX)))
            .map(|(&(_, key), _)| key)
            .collect()
    }
}

/// Asof join operator.
pub struct AsofJoin {
    on: [Vec<ColumnId>; 2],
    time: [ColumnId; 2],
    options: AsofOptions,
    right_arity: usize,
    gate: TemporalGate,
    groups: HashMap<Vec<Value>, Group>,
    lefts: HashMap<Key, (Vec<Value>, i64)>,
    emitted: HashMap<Key, Row>,
}

impl AsofJoin {
    fn new(
        on: [Vec<ColumnId>; 2],
        time: [ColumnId; 2],
        options: AsofOptions,
        right_arity: usize,
        behavior: TemporalBehavior,
    ) -> Self {
        Self {
            on,
            time,
            options,
            right_arity,
            gate: TemporalGate::new(behavior, 2),
            groups: HashMap::new(),
            lefts: HashMap::new(),
            emitted: HashMap::new(),
        }
    }

    /// Number of rows held, both sides.
    pub fn len(&self) -> usize {
        self.groups
            .values()
            .map(|group| group.left.len() + group.right.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn padding(&self) -> Vec<Value> {
        let mut values = vec![Value::Null; self.right_arity];
        for (column, value) in &self.options.defaults {
            if let Some(slot) = values.get_mut(*column) {
                *slot = value.clone();
            }
        }
        values
    }

    /// Output row of a left row under the current state.
    fn result(&self, key: Key) -> Option<Row> {
        let (join_key, time) = self.lefts.get(&key)?;
        let group = self.groups.get(join_key)?;
        let left = group.left.get(&(*time, key))?;
        match group.partner(self.options.direction, *time) {
            Some(right) => Some(left.concat(right)),
            None if self.options.join_type == AsofJoinType::Left => {
                Some(left.with_appended(self.padding()))
            }
            None => None,
        }
    }

    fn evict(&mut self, threshold: i64, out: &mut Vec<Update>) {
        let retract = !self.gate.behavior().keep_results;
        let mut forgotten = Vec::new();
        for group in self.groups.values_mut() {
            let kept = group.left.split_off(&(threshold.saturating_add(1), Key(0)));
            let expired = std::mem::replace(&mut group.left, kept);
            forgotten.extend(expired.into_keys().map(|(_, key)| key));
            // The latest right row at or before the threshold can still be
            // the partner of later left rows
            let latest = group
                .right
                .range(..=(threshold, Key(u128::MAX)))
                .next_back()
                .map(|(slot, _)| *slot);
            if let Some(latest) = latest {
                group.right = group.right.split_off(&latest);
            }
        }
        self.groups.retain(|_, group| !group.is_empty());
        for key in forgotten {
            self.lefts.remove(&key);
            if let Some(row) = self.emitted.remove(&key) {
                if retract {
                    out.push(Update::delete_row(key, row));
                }
            }
        }
    }
}

impl Operator for AsofJoin {
    fn name(&self) -> &str {
        "asof_join"
    }

    fn step(&mut self, ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let admitted = admit(ctx, inputs, Some(self.time), Some(&mut self.gate), "asof_join");
        let [mut left, mut right]: [Vec<_>; 2] = admitted
            .try_into()
            .map_err(|_| Error::invalid_operation("asof join expects two inputs"))?;
        left.sort_by_key(|item| item.update.is_insert());
        right.sort_by_key(|item| item.update.is_insert());

        let mut dirty = BTreeSet::new();
        for item in left {
            let (key, row) = item.update.data;
            let join_key = row.extract(&self.on[0]);
            let group = self.groups.entry(join_key.clone()).or_default();
            if item.update.diff < 0 {
                group.left.remove(&(item.time, key));
                self.lefts.remove(&key);
            } else {
                group.left.insert((item.time, key), row);
                self.lefts.insert(key, (join_key, item.time));
            }
            dirty.insert(key);
        }
        let mut moved = Vec::new();
        for item in right {
            let (key, row) = item.update.data;
            let join_key = row.extract(&self.on[1]);
            let group = self.groups.entry(join_key.clone()).or_default();
            if item.update.diff < 0 {
                group.right.remove(&(item.time, key));
            } else {
                group.right.insert((item.time, key), row);
            }
            moved.push((join_key, item.time));
        }
        for (join_key, time) in moved {
            if let Some(group) = self.groups.get(&join_key) {
                dirty.extend(group.affected(time));
            }
        }
        self.groups.retain(|_, group| !group.is_empty());

        let mut out = Vec::new();
        for key in dirty {
            let new = self.result(key);
            let old = self.emitted.get(&key);
            if old == new.as_ref() {
                continue;
            }
            if let Some(old) = self.emitted.remove(&key) {
                out.push(Update::delete_row(key, old));
            }
            if let Some(new) = new {
                out.push(Update::insert_row(key, new.clone()));
                self.emitted.insert(key, new);
            }
        }
        if let Some(threshold) = self.gate.threshold_any() {
            self.evict(threshold, &mut out);
        }
        Ok(out)
    }
}

impl Dataflow {
    /// Pairs every left row with the closest right row in time among rows
    /// with equal `on` values. Output rows are `left ++ right`, keyed by the
    /// left key.
    pub fn asof_join(
        &mut self,
        left: TableRef,
        right: TableRef,
        time: (ColumnId, ColumnId),
        on: &[(ColumnId, ColumnId)],
        options: AsofOptions,
        behavior: TemporalBehavior,
    ) -> Result<TableRef> {
        let on = split_on(&left, &right, on)?;
        left.check_column(time.0)?;
        right.check_column(time.1)?;
        for (column, _) in &options.defaults {
            right.check_column(*column)?;
        }
        let arity = left.arity + right.arity;
        let op = AsofJoin::new(on, [time.0, time.1], options, right.arity, behavior);
        self.add_operator(&[left, right], arity, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::{row, Timestamp};

    fn op(options: AsofOptions, behavior: TemporalBehavior) -> AsofJoin {
        // left: [t, symbol, qty], right: [t, symbol, price]
        AsofJoin::new([vec![1], vec![1]], [0, 0], options, 3, behavior)
    }

    fn step(op: &mut AsofJoin, left: Vec<Update>, right: Vec<Update>) -> Vec<Update> {
        op.step(&mut StepContext::new(Timestamp(1), "asof_join"), &[&left, &right])
            .unwrap()
    }

    fn quote(key: u128, t: i64, price: i64) -> Update {
        Update::insert_row(Key(key), row![t, "A", price])
    }

    #[test]
    fn test_nearest_tie_goes_backward() {
        let mut op = op(
            AsofOptions::new().direction(AsofDirection::Nearest),
            TemporalBehavior::new(),
        );
        let out = step(
            &mut op,
            vec![Update::insert_row(Key(1), row![10i64, "A", 1i64])],
            vec![quote(2, 8, 80), quote(3, 12, 120)],
        );
        assert_eq!(
            out,
            vec![Update::insert_row(Key(1), row![10i64, "A", 1i64, 8i64, "A", 80i64])]
        );
    }

    #[test]
    fn test_backward_follows_closer_quote() {
        let mut op = op(AsofOptions::new(), TemporalBehavior::new());
        step(
            &mut op,
            vec![Update::insert_row(Key(1), row![10i64, "A", 1i64])],
            vec![quote(2, 5, 50)],
        );
        let out = step(&mut op, Vec::new(), vec![quote(3, 9, 90)]);
        assert_eq!(
            out,
            vec![
                Update::delete_row(Key(1), row![10i64, "A", 1i64, 5i64, "A", 50i64]),
                Update::insert_row(Key(1), row![10i64, "A", 1i64, 9i64, "A", 90i64]),
            ]
        );
        // Later quotes do not concern a backward match
        assert!(step(&mut op, Vec::new(), vec![quote(4, 11, 110)]).is_empty());
    }

    #[test]
    fn test_forward_picks_largest_key_on_equal_times() {
        let mut op = op(
            AsofOptions::new().direction(AsofDirection::Forward),
            TemporalBehavior::new(),
        );
        let out = step(
            &mut op,
            vec![Update::insert_row(Key(1), row![10i64, "A", 1i64])],
            vec![quote(2, 12, 1), quote(7, 12, 7), quote(4, 15, 4)],
        );
        assert_eq!(out[0].row().get(5), Some(&Value::Int(7)));
    }

    #[test]
    fn test_left_defaults_and_groups() {
        let options = AsofOptions::new()
            .join_type(AsofJoinType::Left)
            .with_default(2, 0i64);
        let mut op = op(options, TemporalBehavior::new());
        let out = step(
            &mut op,
            vec![Update::insert_row(Key(1), row![10i64, "B", 1i64])],
            vec![quote(2, 5, 50)],
        );
        assert_eq!(
            out,
            vec![Update::insert_row(
                Key(1),
                Row::new(vec![10i64.into(), "B".into(), 1i64.into(), Value::Null, Value::Null, 0i64.into()])
            )]
        );

        let out = step(&mut op, vec![Update::delete_row(Key(1), row![10i64, "B", 1i64])], Vec::new());
        assert_eq!(out.len(), 1);
        assert!(out[0].is_delete());
        assert!(op.lefts.is_empty());
    }

    #[test]
    fn test_cutoff_keeps_latest_quote() {
        let mut op = op(AsofOptions::new(), TemporalBehavior::new().with_cutoff(10));
        step(&mut op, Vec::new(), vec![quote(2, 1, 10), quote(3, 5, 50)]);
        step(&mut op, Vec::new(), vec![quote(4, 30, 300)]);
        // Quotes at 1 and 5 are behind 30 - 10; only the one at 5 survives
        assert_eq!(op.len(), 2);
        let out = step(
            &mut op,
            vec![Update::insert_row(Key(1), row![25i64, "A", 1i64])],
            Vec::new(),
        );
        assert_eq!(out[0].row().get(5), Some(&Value::Int(50)));

        // Late quote is dropped and changes nothing
        assert!(step(&mut op, Vec::new(), vec![quote(5, 20, 200)]).is_empty());
    }
}
