//! Ingress event log.
//!
//! An `EventLog` accepts changes for one input in any order and hands them
//! out grouped into batches of non-decreasing time. Once a time is closed no
//! further change for it (or any earlier time) is accepted.

use crate::collection::KeyedTable;
use crate::delta::{consolidate, Change, ChangeBatch, Update};
use eddy_core::{Error, Result, Timestamp};
use std::collections::BTreeMap;
use tracing::warn;

/// Result of closing times on an event log.
#[derive(Debug, Default)]
pub struct ClosedBatches {
    /// Consolidated batches in increasing time order
    pub batches: Vec<ChangeBatch>,
    /// Changes removed because they would break the key multiplicity invariant
    pub rejected: Vec<(Change, Error)>,
}

/// Buffered, time-ordered ingress for a single input.
#[derive(Debug)]
pub struct EventLog {
    name: String,
    pending: BTreeMap<Timestamp, Vec<Update>>,
    last_closed: Option<Timestamp>,
    snapshot: KeyedTable,
}

impl EventLog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pending: BTreeMap::new(),
            last_closed: None,
            snapshot: KeyedTable::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the last closed time, if any time was closed.
    #[inline]
    pub fn last_closed(&self) -> Option<Timestamp> {
        self.last_closed
    }

    /// Returns the number of buffered changes.
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Returns the smallest buffered time.
    pub fn min_pending_time(&self) -> Option<Timestamp> {
        self.pending.keys().next().copied()
    }

    /// Returns the largest buffered time.
    pub fn max_pending_time(&self) -> Option<Timestamp> {
        self.pending.keys().next_back().copied()
    }

    /// Returns the snapshot of everything closed so far.
    #[inline]
    pub fn snapshot(&self) -> &KeyedTable {
        &self.snapshot
    }

    /// Buffers a change.
    ///
    /// Changes for a time that is already closed are rejected with
    /// [`Error::LateChange`]; they are never applied silently.
    pub fn push(&mut self, change: Change) -> Result<()> {
        if let Some(last_closed) = self.last_closed {
            if change.time <= last_closed {
                return Err(Error::LateChange {
                    time: change.time,
                    last_closed,
                });
            }
        }
        self.pending
            .entry(change.time)
            .or_default()
            .push(change.into_update());
        Ok(())
    }

    /// Closes every buffered time `<= time`.
    ///
    /// Each closed time yields one consolidated batch. Updates that would make
    /// a key present twice, or retract an absent row, are removed from the
    /// batch and reported as rejections.
    pub fn close_until(&mut self, time: Timestamp) -> ClosedBatches {
        let remaining = self.pending.split_off(&time.next());
        let closed = std::mem::replace(&mut self.pending, remaining);

        let mut result = ClosedBatches::default();
        for (t, updates) in closed {
            let (accepted, rejected) = self.snapshot.partition_valid(consolidate(updates));
            for (update, err) in rejected {
                warn!(input = %self.name, time = %t, key = %update.key(), error = %err, "rejected ingress change");
                result.rejected.push((update.at(t), err));
            }
            self.snapshot.apply_unchecked(&accepted);
            if !accepted.is_empty() {
                result.batches.push(ChangeBatch::new(t, accepted));
            }
        }
        self.last_closed = Some(self.last_closed.map_or(time, |lc| lc.max(time)));
        result
    }

    /// Re-applies a batch that was closed in an earlier run.
    pub fn restore(&mut self, batch: &ChangeBatch) {
        self.snapshot.apply_unchecked(&batch.updates);
        self.last_closed = Some(self.last_closed.map_or(batch.time, |lc| lc.max(batch.time)));
    }
}
