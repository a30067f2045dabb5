//! Keyed collections.
//!
//! A [`KeyedTable`] is the current snapshot of a table: every key maps to at
//! most one row. A [`VersionedTable`] additionally retains the batches that
//! led to the snapshot, so it can answer "as of T" queries.

use crate::delta::{Delta, Update};
use eddy_core::{Error, Key, Result, Row, Timestamp};
use hashbrown::HashMap;
use std::collections::BTreeMap;

/// A snapshot of a table: a map from key to the current row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyedTable {
    rows: HashMap<Key, Row>,
}

impl KeyedTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[inline]
    pub fn get(&self, key: &Key) -> Option<&Row> {
        self.rows.get(key)
    }

    #[inline]
    pub fn contains_key(&self, key: &Key) -> bool {
        self.rows.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Row)> {
        self.rows.iter()
    }

    /// Returns the rows sorted by key.
    pub fn sorted(&self) -> Vec<(Key, Row)> {
        let mut rows: Vec<(Key, Row)> = self.rows.iter().map(|(k, r)| (*k, r.clone())).collect();
        rows.sort();
        rows
    }

    /// Returns the snapshot as a batch of insertions, sorted by key.
    pub fn as_inserts(&self) -> Vec<Update> {
        self.sorted().into_iter().map(Delta::insert).collect()
    }

    /// Returns the updates turning `self` into `other`, sorted.
    pub fn diff_to(&self, other: &KeyedTable) -> Vec<Update> {
        let mut out = Vec::new();
        for (key, row) in &self.rows {
            match other.rows.get(key) {
                Some(new) if new == row => {}
                Some(new) => {
                    out.push(Update::delete_row(*key, row.clone()));
                    out.push(Update::insert_row(*key, new.clone()));
                }
                None => out.push(Update::delete_row(*key, row.clone())),
            }
        }
        for (key, row) in &other.rows {
            if !self.rows.contains_key(key) {
                out.push(Update::insert_row(*key, row.clone()));
            }
        }
        out.sort();
        out
    }

    /// Checks that applying `updates` keeps every key present at most once.
    ///
    /// A retraction must match the row currently stored under its key.
    pub fn check_batch(&self, updates: &[Update]) -> Result<()> {
        let mut per_key: HashMap<Key, Vec<(&Row, i64)>> = HashMap::new();
        for update in updates {
            let rows = per_key.entry(update.key()).or_default();
            match rows.iter_mut().find(|(r, _)| *r == update.row()) {
                Some((_, count)) => *count += update.diff as i64,
                None => rows.push((update.row(), update.diff as i64)),
            }
        }
        for (key, rows) in per_key {
            self.check_key(key, &rows)
                .map_err(|count| Error::MultiplicityViolation { key, count })?;
        }
        Ok(())
    }

    /// Returns the offending count if the key would leave the 0..=1 range.
    fn check_key(&self, key: Key, rows: &[(&Row, i64)]) -> std::result::Result<(), i64> {
        let current = self.rows.get(&key);
        let mut total = current.is_some() as i64;
        for (row, diff) in rows {
            let count = (current == Some(*row)) as i64 + diff;
            if !(0..=1).contains(&count) {
                return Err(count);
            }
            total += diff;
        }
        if !(0..=1).contains(&total) {
            return Err(total);
        }
        Ok(())
    }

    /// Applies a batch atomically: either every update is applied or none is.
    pub fn apply_batch(&mut self, updates: &[Update]) -> Result<()> {
        self.check_batch(updates)?;
        self.apply_unchecked(updates);
        Ok(())
    }

    /// Splits a batch into the updates that keep the invariant and those that
    /// do not. All updates of an offending key are rejected together.
    pub fn partition_valid(&self, updates: Vec<Update>) -> (Vec<Update>, Vec<(Update, Error)>) {
        let mut by_key: BTreeMap<Key, Vec<Update>> = BTreeMap::new();
        for update in updates {
            by_key.entry(update.key()).or_default().push(update);
        }
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for (key, group) in by_key {
            let mut rows: Vec<(&Row, i64)> = Vec::new();
            for u in &group {
                match rows.iter_mut().find(|(r, _)| *r == u.row()) {
                    Some((_, count)) => *count += u.diff as i64,
                    None => rows.push((u.row(), u.diff as i64)),
                }
            }
            match self.check_key(key, &rows) {
                Ok(()) => accepted.extend(group),
                Err(count) => rejected.extend(
                    group
                        .into_iter()
                        .map(|u| (u, Error::MultiplicityViolation { key, count })),
                ),
            }
        }
        (accepted, rejected)
    }

    /// Applies updates without validation. Retractions run before insertions.
    pub fn apply_unchecked(&mut self, updates: &[Update]) {
        for update in updates.iter().filter(|u| u.is_delete()) {
            if self.rows.get(&update.key()) == Some(update.row()) {
                self.rows.remove(&update.key());
            }
        }
        for update in updates.iter().filter(|u| u.is_insert()) {
            self.rows.insert(update.key(), update.row().clone());
        }
    }
}

impl FromIterator<(Key, Row)> for KeyedTable {
    fn from_iter<I: IntoIterator<Item = (Key, Row)>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

/// A table retaining its change history for point-in-time snapshots.
#[derive(Clone, Debug, Default)]
pub struct VersionedTable {
    /// State before the oldest retained batch
    base: KeyedTable,
    /// Retained batches by time
    history: BTreeMap<Timestamp, Vec<Update>>,
    current: KeyedTable,
    /// Times strictly below this were folded into `base`
    compacted_before: Timestamp,
}

impl VersionedTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the latest snapshot.
    #[inline]
    pub fn current(&self) -> &KeyedTable {
        &self.current
    }

    /// Returns the time of the latest applied batch.
    pub fn last_time(&self) -> Option<Timestamp> {
        self.history.keys().next_back().copied()
    }

    /// Applies the batch closed at `time`.
    ///
    /// Times must strictly increase; the batch is applied atomically.
    pub fn apply(&mut self, time: Timestamp, updates: Vec<Update>) -> Result<()> {
        if let Some(last) = self.last_time() {
            if time <= last {
                return Err(Error::LateChange {
                    time,
                    last_closed: last,
                });
            }
        }
        if time < self.compacted_before {
            return Err(Error::LateChange {
                time,
                last_closed: self.compacted_before,
            });
        }
        self.current.apply_batch(&updates)?;
        self.history.insert(time, updates);
        Ok(())
    }

    /// Returns the snapshot reflecting exactly the batches with time `<= time`.
    pub fn as_of(&self, time: Timestamp) -> Result<KeyedTable> {
        if time.next() < self.compacted_before {
            return Err(Error::invalid_operation(format!(
                "history before {} was compacted",
                self.compacted_before
            )));
        }
        let mut snapshot = self.base.clone();
        for (_, updates) in self.history.range(..=time) {
            snapshot.apply_unchecked(updates);
        }
        Ok(snapshot)
    }

    /// Folds every batch with time strictly below `time` into the base state.
    pub fn compact_before(&mut self, time: Timestamp) {
        let retained = self.history.split_off(&time);
        for (_, updates) in std::mem::replace(&mut self.history, retained) {
            self.base.apply_unchecked(&updates);
        }
        self.compacted_before = self.compacted_before.max(time);
    }

    /// Returns the number of retained batches.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::row;

    fn key(i: i64) -> Key {
        Key::for_values(&[i.into()])
    }

    #[test]
    fn test_apply_batch_and_update() {
        let mut table = KeyedTable::new();
        table
            .apply_batch(&[Update::insert_row(key(1), row![1i64, "a"])])
            .unwrap();
        assert_eq!(table.len(), 1);

        table
            .apply_batch(&[
                Update::insert_row(key(1), row![1i64, "b"]),
                Update::delete_row(key(1), row![1i64, "a"]),
            ])
            .unwrap();
        assert_eq!(table.get(&key(1)), Some(&row![1i64, "b"]));
    }

    #[test]
    fn test_apply_batch_is_atomic() {
        let mut table = KeyedTable::new();
        table
            .apply_batch(&[Update::insert_row(key(1), row![1i64])])
            .unwrap();

        let result = table.apply_batch(&[
            Update::insert_row(key(2), row![2i64]),
            Update::insert_row(key(1), row![10i64]),
        ]);
        assert!(matches!(result, Err(Error::MultiplicityViolation { .. })));
        assert_eq!(table.len(), 1);
        assert!(!table.contains_key(&key(2)));
    }

    #[test]
    fn test_retract_absent_is_violation() {
        let table = KeyedTable::new();
        let result = table.check_batch(&[Update::delete_row(key(1), row![1i64])]);
        assert!(matches!(
            result,
            Err(Error::MultiplicityViolation { count: -1, .. })
        ));
    }

    #[test]
    fn test_partition_valid() {
        let mut table = KeyedTable::new();
        table
            .apply_batch(&[Update::insert_row(key(1), row![1i64])])
            .unwrap();
        let (ok, bad) = table.partition_valid(vec![
            Update::insert_row(key(1), row![5i64]),
            Update::insert_row(key(2), row![2i64]),
        ]);
        assert_eq!(ok, vec![Update::insert_row(key(2), row![2i64])]);
        assert_eq!(bad.len(), 1);
    }

    #[test]
    fn test_diff_to() {
        let a: KeyedTable = vec![(key(1), row![1i64]), (key(2), row![2i64])].into_iter().collect();
        let b: KeyedTable = vec![(key(1), row![10i64]), (key(3), row![3i64])].into_iter().collect();
        let diff = a.diff_to(&b);
        let mut c = a.clone();
        c.apply_batch(&diff).unwrap();
        assert_eq!(c, b);
        assert!(a.diff_to(&a).is_empty());
    }

    #[test]
    fn test_versioned_as_of() {
        let mut table = VersionedTable::new();
        table
            .apply(Timestamp(1), vec![Update::insert_row(key(1), row![1i64])])
            .unwrap();
        table
            .apply(
                Timestamp(3),
                vec![
                    Update::delete_row(key(1), row![1i64]),
                    Update::insert_row(key(1), row![2i64]),
                ],
            )
            .unwrap();

        assert!(table.as_of(Timestamp(0)).unwrap().is_empty());
        assert_eq!(table.as_of(Timestamp(2)).unwrap().get(&key(1)), Some(&row![1i64]));
        assert_eq!(table.as_of(Timestamp(3)).unwrap().get(&key(1)), Some(&row![2i64]));

        assert!(matches!(
            table.apply(Timestamp(2), vec![]),
            Err(Error::LateChange { .. })
        ));
    }

    #[test]
    fn test_versioned_compaction() {
        let mut table = VersionedTable::new();
        for t in 1..=4i64 {
            table
                .apply(Timestamp(t as u64), vec![Update::insert_row(key(t), row![t])])
                .unwrap();
        }
        table.compact_before(Timestamp(3));
        assert_eq!(table.history_len(), 2);
        assert_eq!(table.as_of(Timestamp(3)).unwrap().len(), 3);
        assert!(table.as_of(Timestamp(1)).is_err());
        assert_eq!(table.current().len(), 4);
    }
}
