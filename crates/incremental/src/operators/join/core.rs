//! Match-count bookkeeping shared by the equality, interval and window joins.

use crate::delta::Update;
use eddy_core::{Key, Row, Value};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which rows without a partner are kept.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Right,
    Outer,
}

impl JoinType {
    /// Whether unmatched rows of `side` appear padded with nulls.
    pub fn keeps_unmatched(&self, side: Side) -> bool {
        match side {
            Side::Left => matches!(self, JoinType::Left | JoinType::Outer),
            Side::Right => matches!(self, JoinType::Right | JoinType::Outer),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Side {
    Left = 0,
    Right = 1,
}

impl Side {
    #[inline]
    pub fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A row held by a join.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinEntry {
    pub key: Key,
    pub row: Row,
    /// Values of the equality columns
    pub join_key: Vec<Value>,
    /// Event time, or the time after which the entry can no longer match
    pub time: i64,
    /// `window_start` and `window_end` appended to the output
    pub window: Option<[Value; 2]>,
}

impl JoinEntry {
    pub fn new(key: Key, row: Row, join_key: Vec<Value>, time: i64) -> Self {
        Self {
            key,
            row,
            join_key,
            time,
            window: None,
        }
    }
}

/// Storage of join entries answering "which entries of the other side does
/// this entry match".
pub trait MatchIndex: Send {
    fn insert(&mut self, side: Side, entry: JoinEntry);

    fn remove(&mut self, side: Side, key: Key, join_key: &[Value], time: i64) -> Option<JoinEntry>;

    /// Entries of `side.other()` matching `incoming`, which belongs to `side`.
    fn matches(&self, side: Side, incoming: &JoinEntry) -> Vec<&JoinEntry>;

    /// Time at or below which no future record of the other side can match.
    fn horizon(&self, _side: Side, time: i64) -> i64 {
        time
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Incremental join over a [`MatchIndex`].
///
/// Every entry counts the result pairs it is part of. An entry of a side
/// kept by the join type shows up padded with nulls while its count is zero.
pub struct JoinCore<I> {
    index: I,
    join_type: JoinType,
    arity: [usize; 2],
    match_counts: [HashMap<Key, usize>; 2],
    by_horizon: [BTreeMap<(i64, Key), (Vec<Value>, i64)>; 2],
}

impl<I: MatchIndex> JoinCore<I> {
    pub fn new(index: I, join_type: JoinType, left_arity: usize, right_arity: usize) -> Self {
        Self {
            index,
            join_type,
            arity: [left_arity, right_arity],
            match_counts: [HashMap::new(), HashMap::new()],
            by_horizon: [BTreeMap::new(), BTreeMap::new()],
        }
    }

    #[inline]
    pub fn index(&self) -> &I {
        &self.index
    }

    #[inline]
    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    /// Number of entries held on one side.
    pub fn len(&self, side: Side) -> usize {
        self.by_horizon[side.index()].len()
    }

    fn pair(&self, side: Side, incoming: &JoinEntry, other: &JoinEntry) -> (Key, Row) {
        let (left, right) = match side {
            Side::Left => (incoming, other),
            Side::Right => (other, incoming),
        };
        let mut values = left.row.to_vec();
        values.extend(right.row.iter().cloned());
        if let Some(window) = incoming.window.as_ref().or(other.window.as_ref()) {
            values.extend(window.iter().cloned());
        }
        (Key::for_pair(left.key, right.key), Row::new(values))
    }

    fn padded(&self, side: Side, entry: &JoinEntry) -> (Key, Row) {
        let mut values = Vec::with_capacity(self.arity[0] + self.arity[1] + 2);
        let key = match side {
            Side::Left => {
                values.extend(entry.row.iter().cloned());
                values.extend(std::iter::repeat(Value::Null).take(self.arity[1]));
                Key::for_pair(entry.key, Key::ABSENT)
            }
            Side::Right => {
                values.extend(std::iter::repeat(Value::Null).take(self.arity[0]));
                values.extend(entry.row.iter().cloned());
                Key::for_pair(Key::ABSENT, entry.key)
            }
        };
        if let Some(window) = &entry.window {
            values.extend(window.iter().cloned());
        }
        (key, Row::new(values))
    }

    pub fn insert(&mut self, side: Side, entry: JoinEntry, out: &mut Vec<Update>) {
        let other = side.other();
        let matches: Vec<JoinEntry> = self
            .index
            .matches(side, &entry)
            .into_iter()
            .cloned()
            .collect();
        for m in &matches {
            let (key, row) = self.pair(side, &entry, m);
            out.push(Update::insert_row(key, row));
            let count = self.match_counts[other.index()]
                .get(&m.key)
                .copied()
                .unwrap_or(0);
            if count == 0 && self.join_type.keeps_unmatched(other) {
                let (key, row) = self.padded(other, m);
                out.push(Update::delete_row(key, row));
            }
            self.match_counts[other.index()].insert(m.key, count + 1);
        }
        if matches.is_empty() && self.join_type.keeps_unmatched(side) {
            let (key, row) = self.padded(side, &entry);
            out.push(Update::insert_row(key, row));
        }
        self.match_counts[side.index()].insert(entry.key, matches.len());
        let horizon = self.index.horizon(side, entry.time);
        self.by_horizon[side.index()].insert((horizon, entry.key), (entry.join_key.clone(), entry.time));
        self.index.insert(side, entry);
    }

    pub fn delete(&mut self, side: Side, key: Key, join_key: &[Value], time: i64, out: &mut Vec<Update>) {
        let Some(entry) = self.index.remove(side, key, join_key, time) else {
            return;
        };
        let horizon = self.index.horizon(side, time);
        self.by_horizon[side.index()].remove(&(horizon, key));
        self.retract_entry(side, entry, out);
    }

    fn retract_entry(&mut self, side: Side, entry: JoinEntry, out: &mut Vec<Update>) {
        let other = side.other();
        let matches: Vec<JoinEntry> = self
            .index
            .matches(side, &entry)
            .into_iter()
            .cloned()
            .collect();
        for m in &matches {
            let (key, row) = self.pair(side, &entry, m);
            out.push(Update::delete_row(key, row));
            if let Some(count) = self.match_counts[other.index()].get_mut(&m.key) {
                *count = count.saturating_sub(1);
                if *count == 0 && self.join_type.keeps_unmatched(other) {
                    let (key, row) = self.padded(other, m);
                    out.push(Update::insert_row(key, row));
                }
            }
        }
        let count = self.match_counts[side.index()]
            .remove(&entry.key)
            .unwrap_or(0);
        if count == 0 && self.join_type.keeps_unmatched(side) {
            let (key, row) = self.padded(side, &entry);
            out.push(Update::delete_row(key, row));
        }
    }

    /// Forgets every entry whose horizon is at or below `threshold`.
    ///
    /// With `retract` the results involving the forgotten entries are
    /// deleted. Otherwise they stay in the output and the partners keep
    /// counting them.
    pub fn evict(&mut self, threshold: i64, retract: bool, out: &mut Vec<Update>) -> usize {
        let mut evicted = 0;
        for side in [Side::Left, Side::Right] {
            let kept = self.by_horizon[side.index()].split_off(&(threshold.saturating_add(1), Key(0)));
            let expired = std::mem::replace(&mut self.by_horizon[side.index()], kept);
            for ((_, key), (join_key, time)) in expired {
                let Some(entry) = self.index.remove(side, key, &join_key, time) else {
                    continue;
                };
                evicted += 1;
                if retract {
                    self.retract_entry(side, entry, out);
                } else {
                    self.match_counts[side.index()].remove(&key);
                }
            }
        }
        evicted
    }
}
