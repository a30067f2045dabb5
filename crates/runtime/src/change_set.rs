//! Per-batch changes of an output table.
//!
//! A `ChangeSet` is what subscribers see for one closed time: the rows that
//! left the table and the rows that entered it.

use eddy_core::{Key, Row, Timestamp};
use eddy_incremental::{Change, Update};
use hashbrown::HashMap;

/// Changes of one output at one time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeSet {
    pub time: Timestamp,
    /// Rows that were inserted
    pub added: Vec<(Key, Row)>,
    /// Rows that were retracted
    pub removed: Vec<(Key, Row)>,
}

impl ChangeSet {
    #[inline]
    pub fn new(time: Timestamp) -> Self {
        Self {
            time,
            ..Self::default()
        }
    }

    /// Splits consolidated updates into additions and removals.
    pub fn from_updates(time: Timestamp, updates: &[Update]) -> Self {
        let mut changes = Self::new(time);
        for update in updates {
            if update.is_insert() {
                changes.add(update.key(), update.row().clone());
            } else if update.is_delete() {
                changes.remove(update.key(), update.row().clone());
            }
        }
        changes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    #[inline]
    pub fn add(&mut self, key: Key, row: Row) {
        self.added.push((key, row));
    }

    #[inline]
    pub fn remove(&mut self, key: Key, row: Row) {
        self.removed.push((key, row));
    }

    /// Keys that were both removed and added, as `(key, old, new)`.
    pub fn modified(&self) -> Vec<(Key, &Row, &Row)> {
        let old: HashMap<Key, &Row> = self.removed.iter().map(|(k, r)| (*k, r)).collect();
        self.added
            .iter()
            .filter_map(|(key, new)| old.get(key).map(|old| (*key, *old, new)))
            .collect()
    }

    /// Returns the changes with retractions first.
    pub fn changes(&self) -> Vec<Change> {
        let removed = self
            .removed
            .iter()
            .map(|(k, r)| Change::delete(*k, r.clone(), self.time));
        let added = self
            .added
            .iter()
            .map(|(k, r)| Change::insert(*k, r.clone(), self.time));
        removed.chain(added).collect()
    }
}
