//! Delta types for incremental computation.
//!
//! A `Delta` represents a change to a data item, with a diff value indicating
//! whether it's an insertion (+1) or a retraction (-1). Inside the dataflow the
//! data item is a `(Key, Row)` pair, see [`Update`]. At the ingress and egress
//! boundaries changes additionally carry their processing time, see [`Change`].

use eddy_core::{Key, Row, Timestamp};
use serde::{Deserialize, Serialize};

/// A differential change to a data item.
///
/// The `diff` field indicates the multiplicity of the change:
/// - `+1` means insertion
/// - `-1` means retraction
/// - Other values appear only transiently before consolidation
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Delta<T> {
    /// The data being changed
    pub data: T,
    /// The differential: +1 for insert, -1 for delete
    pub diff: i32,
}

impl<T> Delta<T> {
    #[inline]
    pub fn new(data: T, diff: i32) -> Self {
        Self { data, diff }
    }

    /// Creates an insertion delta (+1).
    #[inline]
    pub fn insert(data: T) -> Self {
        Self { data, diff: 1 }
    }

    /// Creates a retraction delta (-1).
    #[inline]
    pub fn delete(data: T) -> Self {
        Self { data, diff: -1 }
    }

    #[inline]
    pub fn is_insert(&self) -> bool {
        self.diff > 0
    }

    #[inline]
    pub fn is_delete(&self) -> bool {
        self.diff < 0
    }

    /// Maps the data to a new type, keeping the diff.
    #[inline]
    pub fn map<U, F>(self, f: F) -> Delta<U>
    where
        F: FnOnce(T) -> U,
    {
        Delta {
            data: f(self.data),
            diff: self.diff,
        }
    }
}

/// A batch of deltas.
pub type DeltaBatch<T> = Vec<Delta<T>>;

/// Sorts a batch, merges equal data items and drops zero diffs.
///
/// The result is in a canonical order, so two batches with the same net
/// effect consolidate to the same vector.
pub fn consolidate<T: Ord>(mut batch: DeltaBatch<T>) -> DeltaBatch<T> {
    batch.sort_by(|a, b| a.data.cmp(&b.data));
    let mut out: DeltaBatch<T> = Vec::with_capacity(batch.len());
    for delta in batch {
        match out.last_mut() {
            Some(last) if last.data == delta.data => last.diff += delta.diff,
            _ => {
                if out.last().is_some_and(|l| l.diff == 0) {
                    out.pop();
                }
                out.push(delta);
            }
        }
    }
    if out.last().is_some_and(|l| l.diff == 0) {
        out.pop();
    }
    out
}

/// A keyed row change inside a batch.
pub type Update = Delta<(Key, Row)>;

impl Delta<(Key, Row)> {
    /// Creates a keyed insertion.
    #[inline]
    pub fn insert_row(key: Key, row: Row) -> Self {
        Delta::insert((key, row))
    }

    /// Creates a keyed retraction.
    #[inline]
    pub fn delete_row(key: Key, row: Row) -> Self {
        Delta::delete((key, row))
    }

    #[inline]
    pub fn key(&self) -> Key {
        self.data.0
    }

    #[inline]
    pub fn row(&self) -> &Row {
        &self.data.1
    }

    /// Attaches a processing time.
    pub fn at(self, time: Timestamp) -> Change {
        Change {
            key: self.data.0,
            row: self.data.1,
            time,
            diff: self.diff,
        }
    }
}

/// A timestamped change crossing the ingress or egress boundary.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Change {
    pub key: Key,
    pub row: Row,
    pub time: Timestamp,
    pub diff: i32,
}

impl Change {
    pub fn insert(key: Key, row: Row, time: Timestamp) -> Self {
        Self {
            key,
            row,
            time,
            diff: 1,
        }
    }

    pub fn delete(key: Key, row: Row, time: Timestamp) -> Self {
        Self {
            key,
            row,
            time,
            diff: -1,
        }
    }

    /// Drops the time, keeping the keyed delta.
    pub fn into_update(self) -> Update {
        Delta::new((self.key, self.row), self.diff)
    }
}

/// All consolidated updates of one input sharing a processing time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub time: Timestamp,
    pub updates: Vec<Update>,
}

impl ChangeBatch {
    pub fn new(time: Timestamp, updates: Vec<Update>) -> Self {
        Self { time, updates }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Returns the batch as timestamped changes.
    pub fn changes(&self) -> impl Iterator<Item = Change> + '_ {
        self.updates.iter().map(move |u| u.clone().at(self.time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::row;

    #[test]
    fn test_delta_insert_delete() {
        let d = Delta::insert(42);
        assert!(d.is_insert());
        assert!(!d.is_delete());
        let d = Delta::delete(42);
        assert!(d.is_delete());
        assert_eq!(d.diff, -1);
    }

    #[test]
    fn test_delta_map_keeps_diff() {
        let mapped = Delta::delete(21).map(|x| x * 2);
        assert_eq!(mapped, Delta::delete(42));
        assert!(mapped.is_delete());
    }

    #[test]
    fn test_consolidate() {
        let batch = vec![
            Delta::insert(3),
            Delta::insert(1),
            Delta::delete(3),
            Delta::insert(1),
            Delta::delete(2),
        ];
        assert_eq!(consolidate(batch), vec![Delta::new(1, 2), Delta::delete(2)]);
        assert!(consolidate(vec![Delta::insert(1), Delta::delete(1)]).is_empty());
    }

    #[test]
    fn test_update_accessors() {
        let key = Key::for_values(&[1i64.into()]);
        let u = Update::insert_row(key, row![1i64, "a"]);
        assert_eq!(u.key(), key);
        assert_eq!(u.row().len(), 2);
        let change = u.at(Timestamp(4));
        assert_eq!(change.time, Timestamp(4));
        assert_eq!(change.into_update().diff, 1);
    }
}
