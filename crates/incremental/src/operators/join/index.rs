//! Join indexes.

use super::core::{JoinEntry, MatchIndex, Side};
use eddy_core::{Key, Value};
use hashbrown::HashMap;
use std::collections::BTreeMap;

/// Matches entries with equal join keys.
#[derive(Debug, Default)]
pub struct EquiIndex {
    sides: [HashMap<Vec<Value>, BTreeMap<Key, JoinEntry>>; 2],
}

impl EquiIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MatchIndex for EquiIndex {
    fn insert(&mut self, side: Side, entry: JoinEntry) {
        self.sides[side.index()]
            .entry(entry.join_key.clone())
            .or_default()
            .insert(entry.key, entry);
    }

    fn remove(&mut self, side: Side, key: Key, join_key: &[Value], _time: i64) -> Option<JoinEntry> {
        let bucket = self.sides[side.index()].get_mut(join_key)?;
        let entry = bucket.remove(&key);
        if bucket.is_empty() {
            self.sides[side.index()].remove(join_key);
        }
        entry
    }

    fn matches(&self, side: Side, incoming: &JoinEntry) -> Vec<&JoinEntry> {
        self.sides[side.other().index()]
            .get(&incoming.join_key)
            .map(|bucket| bucket.values().collect())
            .unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.sides
            .iter()
            .flat_map(|side| side.values())
            .map(BTreeMap::len)
            .sum()
    }
}

/// Matches entries with equal join keys whose times satisfy
/// `lower <= t_right - t_left <= upper`.
#[derive(Debug)]
pub struct IntervalIndex {
    lower: i64,
    upper: i64,
    sides: [HashMap<Vec<Value>, BTreeMap<(i64, Key), JoinEntry>>; 2],
}

impl IntervalIndex {
    pub fn new(lower: i64, upper: i64) -> Self {
        Self {
            lower,
            upper,
            sides: [HashMap::new(), HashMap::new()],
        }
    }

    /// Range of times on the other side that `time` on `side` can match.
    fn partner_range(&self, side: Side, time: i64) -> (i64, i64) {
        match side {
            Side::Left => (time.saturating_add(self.lower), time.saturating_add(self.upper)),
            Side::Right => (time.saturating_sub(self.upper), time.saturating_sub(self.lower)),
        }
    }
}

impl MatchIndex for IntervalIndex {
    fn insert(&mut self, side: Side, entry: JoinEntry) {
        self.sides[side.index()]
            .entry(entry.join_key.clone())
            .or_default()
            .insert((entry.time, entry.key), entry);
    }

    fn remove(&mut self, side: Side, key: Key, join_key: &[Value], time: i64) -> Option<JoinEntry> {
        let bucket = self.sides[side.index()].get_mut(join_key)?;
        let entry = bucket.remove(&(time, key));
        if bucket.is_empty() {
            self.sides[side.index()].remove(join_key);
        }
        entry
    }

    fn matches(&self, side: Side, incoming: &JoinEntry) -> Vec<&JoinEntry> {
        let Some(bucket) = self.sides[side.other().index()].get(&incoming.join_key) else {
            return Vec::new();
        };
        let (from, to) = self.partner_range(side, incoming.time);
        if from > to {
            return Vec::new();
        }
        bucket
            .range((from, Key(0))..=(to, Key(u128::MAX)))
            .map(|(_, entry)| entry)
            .collect()
    }

    fn horizon(&self, side: Side, time: i64) -> i64 {
        // Largest partner time this entry can still match
        self.partner_range(side, time).1
    }

    fn len(&self) -> usize {
        self.sides
            .iter()
            .flat_map(|side| side.values())
            .map(BTreeMap::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::row;

    fn entry(key: u128, join: i64, time: i64) -> JoinEntry {
        JoinEntry::new(Key(key), row![join, time], vec![Value::Int(join)], time)
    }

    #[test]
    fn test_equi_matches_by_key() {
        let mut index = EquiIndex::new();
        index.insert(Side::Right, entry(1, 7, 0));
        index.insert(Side::Right, entry(2, 8, 0));
        assert_eq!(index.matches(Side::Left, &entry(3, 7, 0)).len(), 1);
        assert!(index.matches(Side::Right, &entry(3, 7, 0)).is_empty());
        assert!(index.remove(Side::Right, Key(1), &[Value::Int(7)], 0).is_some());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_interval_bounds_are_inclusive() {
        let mut index = IntervalIndex::new(-2, 3);
        for (k, t) in [(1, 7), (2, 8), (3, 13), (4, 14)] {
            index.insert(Side::Right, entry(k, 0, t));
        }
        let found: Vec<Key> = index
            .matches(Side::Left, &entry(9, 0, 10))
            .iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(found, vec![Key(2), Key(3)]);

        index.insert(Side::Left, entry(5, 0, 10));
        assert_eq!(index.matches(Side::Right, &entry(6, 0, 12)).len(), 1);
        assert_eq!(index.horizon(Side::Left, 10), 13);
        assert_eq!(index.horizon(Side::Right, 10), 12);
    }
}
