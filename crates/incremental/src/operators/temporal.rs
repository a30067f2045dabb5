//! Temporal behavior: cutoff, delay and result retention.
//!
//! Event times come from a time column (see [`Value::as_time`]). A
//! [`TimeTracker`] remembers the largest event time admitted so far. Records
//! are judged against the state reached by previous batches: a record with
//! `time <= max_seen - cutoff` is late and dropped. Once a batch is admitted
//! the tracker advances, and operators evict state that fell behind the new
//! threshold. With a delay, insertions wait until `max_seen >= time + delay`.

use crate::dataflow::{ColumnId, Dataflow, Operator, TableRef};
use crate::delta::Update;
use crate::error_log::StepContext;
use eddy_core::{DataError, DataResult, DataType, Key, Result, Row, Value};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Cutoff, delay and retention policy of a temporal operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalBehavior {
    /// Records at or below `max_seen - cutoff` are ignored
    pub cutoff: Option<i64>,
    /// Insertions are held until `max_seen >= time + delay`
    pub delay: Option<i64>,
    /// Whether results of forgotten records stay in the output
    pub keep_results: bool,
}

impl Default for TemporalBehavior {
    fn default() -> Self {
        Self {
            cutoff: None,
            delay: None,
            keep_results: true,
        }
    }
}

impl TemporalBehavior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cutoff(mut self, cutoff: i64) -> Self {
        self.cutoff = Some(cutoff);
        self
    }

    pub fn with_delay(mut self, delay: i64) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn keep_results(mut self, keep: bool) -> Self {
        self.keep_results = keep;
        self
    }

    /// Whether the behavior changes anything at all.
    pub fn is_noop(&self) -> bool {
        self.cutoff.is_none() && self.delay.is_none()
    }
}

/// Largest event time seen, globally or per instance.
#[derive(Clone, Debug, Default)]
pub struct TimeTracker {
    global: Option<i64>,
    instances: Option<HashMap<Key, i64>>,
}

impl TimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker keeping a separate maximum for every instance.
    pub fn per_instance() -> Self {
        Self {
            global: None,
            instances: Some(HashMap::new()),
        }
    }

    pub fn max_seen(&self, instance: Key) -> Option<i64> {
        match &self.instances {
            Some(instances) => instances.get(&instance).copied(),
            None => self.global,
        }
    }

    /// Largest time over all instances.
    pub fn max_seen_any(&self) -> Option<i64> {
        self.global
    }

    pub fn observe(&mut self, instance: Key, time: i64) {
        self.global = Some(self.global.map_or(time, |m| m.max(time)));
        if let Some(instances) = &mut self.instances {
            let entry = instances.entry(instance).or_insert(time);
            *entry = (*entry).max(time);
        }
    }
}

/// An update together with its event time and instance.
#[derive(Clone, Debug, PartialEq)]
pub struct Timed {
    pub update: Update,
    pub time: i64,
    pub instance: Key,
}

/// Reads the event time of a row.
pub fn event_time(row: &Row, column: ColumnId) -> DataResult<i64> {
    let value = row.get(column).unwrap_or(&Value::Null);
    value
        .as_time()
        .ok_or_else(|| DataError::coercion(value, DataType::DateTime))
}

/// Attaches event times to updates; rows without a valid time are reported
/// and skipped.
pub fn attach_times(
    ctx: &mut StepContext,
    updates: &[Update],
    time_column: ColumnId,
    instance: &[ColumnId],
) -> Vec<Timed> {
    let mut out = Vec::with_capacity(updates.len());
    for update in updates {
        match event_time(update.row(), time_column) {
            Ok(time) => out.push(Timed {
                update: update.clone(),
                time,
                instance: if instance.is_empty() {
                    Key::ABSENT
                } else {
                    Key::for_values(&update.row().extract(instance))
                },
            }),
            Err(err) => {
                if update.is_insert() {
                    ctx.report(Some(update.key()), &err);
                }
            }
        }
    }
    out
}

/// Late-record filtering and delay buffering shared by temporal operators.
#[derive(Debug)]
pub struct TemporalGate {
    behavior: TemporalBehavior,
    tracker: TimeTracker,
    pending: Vec<BTreeMap<(i64, Key), Timed>>,
    late_dropped: u64,
}

impl TemporalGate {
    pub fn new(behavior: TemporalBehavior, inputs: usize) -> Self {
        Self::with_tracker(behavior, inputs, TimeTracker::new())
    }

    pub fn with_tracker(behavior: TemporalBehavior, inputs: usize, tracker: TimeTracker) -> Self {
        Self {
            behavior,
            tracker,
            pending: (0..inputs).map(|_| BTreeMap::new()).collect(),
            late_dropped: 0,
        }
    }

    #[inline]
    pub fn behavior(&self) -> &TemporalBehavior {
        &self.behavior
    }

    #[inline]
    pub fn tracker(&self) -> &TimeTracker {
        &self.tracker
    }

    /// Number of records dropped for arriving behind the cutoff.
    #[inline]
    pub fn late_dropped(&self) -> u64 {
        self.late_dropped
    }

    /// Number of insertions held back by the delay.
    pub fn pending_len(&self) -> usize {
        self.pending.iter().map(BTreeMap::len).sum()
    }

    /// Times at or below the threshold are forgotten.
    pub fn threshold(&self, instance: Key) -> Option<i64> {
        let cutoff = self.behavior.cutoff?;
        self.tracker
            .max_seen(instance)
            .map(|max| max.saturating_sub(cutoff))
    }

    /// Lowest threshold over all instances that have one.
    pub fn threshold_any(&self) -> Option<i64> {
        let cutoff = self.behavior.cutoff?;
        self.tracker
            .max_seen_any()
            .map(|max| max.saturating_sub(cutoff))
    }

    fn is_late(&self, item: &Timed) -> bool {
        self.threshold(item.instance)
            .is_some_and(|threshold| item.time <= threshold)
    }

    fn is_ripe(&self, item: &Timed, delay: i64) -> bool {
        self.tracker
            .max_seen(item.instance)
            .is_some_and(|max| item.time.saturating_add(delay) <= max)
    }

    /// Admits one batch per input and returns what each input releases.
    pub fn process(&mut self, operator: &str, inputs: Vec<Vec<Timed>>) -> Vec<Vec<Timed>> {
        let mut admitted = Vec::with_capacity(inputs.len());
        for batch in inputs {
            let mut kept = Vec::with_capacity(batch.len());
            for item in batch {
                if self.is_late(&item) {
                    self.late_dropped += 1;
                    debug!(
                        operator,
                        key = %item.update.key(),
                        time = item.time,
                        threshold = self.threshold(item.instance),
                        "dropping late record"
                    );
                } else {
                    kept.push(item);
                }
            }
            admitted.push(kept);
        }
        for item in admitted.iter().flatten() {
            self.tracker.observe(item.instance, item.time);
        }

        let Some(delay) = self.behavior.delay else {
            return admitted;
        };
        let mut released = Vec::with_capacity(admitted.len());
        for (side, mut batch) in admitted.into_iter().enumerate() {
            // An update is delete-old plus insert-new under one slot
            batch.sort_by_key(|item| item.update.is_insert());
            let mut out = Vec::new();
            for item in batch {
                let slot = (item.time, item.update.key());
                if item.update.is_delete() {
                    // Cancels a held insertion, or retracts a released one
                    if self.pending[side].remove(&slot).is_none() {
                        out.push(item);
                    }
                } else {
                    self.pending[side].insert(slot, item);
                }
            }
            released.push(out);
        }
        self.release(delay, &mut released);
        released
    }

    fn release(&mut self, delay: i64, released: &mut [Vec<Timed>]) {
        let Some(max) = self.tracker.max_seen_any() else {
            return;
        };
        let limit = max.saturating_sub(delay);
        for side in 0..self.pending.len() {
            let ready: Vec<(i64, Key)> = self.pending[side]
                .range(..=(limit, Key(u128::MAX)))
                .filter(|(_, item)| self.is_ripe(item, delay))
                .map(|(slot, _)| *slot)
                .collect();
            for slot in ready {
                if let Some(item) = self.pending[side].remove(&slot) {
                    released[side].push(item);
                }
            }
        }
    }
}

/// Holds insertions back until the stream has advanced past them.
pub struct Buffer {
    time_column: ColumnId,
    gate: TemporalGate,
}

impl Operator for Buffer {
    fn name(&self) -> &str {
        "buffer"
    }

    fn step(&mut self, ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let timed = attach_times(ctx, inputs[0], self.time_column, &[]);
        let released = self.gate.process("buffer", vec![timed]);
        Ok(released
            .into_iter()
            .flatten()
            .map(|item| item.update)
            .collect())
    }
}

/// Drops late records and forgets rows that fell behind the cutoff.
pub struct Forget {
    time_column: ColumnId,
    gate: TemporalGate,
    live: BTreeMap<(i64, Key), Row>,
}

impl Forget {
    /// Number of rows still tracked.
    pub fn live_len(&self) -> usize {
        self.live.len()
    }
}

impl Operator for Forget {
    fn name(&self) -> &str {
        "forget"
    }

    fn step(&mut self, ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let timed = attach_times(ctx, inputs[0], self.time_column, &[]);
        let released = self.gate.process("forget", vec![timed]);
        let mut out = Vec::new();
        for item in released.into_iter().flatten() {
            let slot = (item.time, item.update.key());
            if item.update.is_insert() {
                self.live.insert(slot, item.update.row().clone());
            } else {
                self.live.remove(&slot);
            }
            out.push(item.update);
        }

        if let Some(threshold) = self.gate.threshold(Key::ABSENT) {
            let kept = self.live.split_off(&(threshold.saturating_add(1), Key(0)));
            let expired = std::mem::replace(&mut self.live, kept);
            if !expired.is_empty() {
                debug!(threshold, rows = expired.len(), "forgetting rows");
            }
            if !self.gate.behavior().keep_results {
                out.extend(
                    expired
                        .into_iter()
                        .map(|((_, key), row)| Update::delete_row(key, row)),
                );
            }
        }
        Ok(out)
    }
}

impl Dataflow {
    /// Delays insertions until the largest seen time in `time_column`
    /// reaches their own time plus `delay`.
    pub fn buffer(&mut self, table: TableRef, time_column: ColumnId, delay: i64) -> Result<TableRef> {
        table.check_column(time_column)?;
        let behavior = TemporalBehavior::new().with_delay(delay);
        self.add_operator(
            &[table],
            table.arity,
            Buffer {
                time_column,
                gate: TemporalGate::new(behavior, 1),
            },
        )
    }

    /// Ignores records older than `cutoff` behind the largest seen time.
    ///
    /// Forgotten rows stay in the output when `keep_results` is set and are
    /// retracted otherwise.
    pub fn forget(
        &mut self,
        table: TableRef,
        time_column: ColumnId,
        cutoff: i64,
        keep_results: bool,
    ) -> Result<TableRef> {
        table.check_column(time_column)?;
        let behavior = TemporalBehavior::new()
            .with_cutoff(cutoff)
            .keep_results(keep_results);
        self.add_operator(
            &[table],
            table.arity,
            Forget {
                time_column,
                gate: TemporalGate::new(behavior, 1),
                live: BTreeMap::new(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::{row, Timestamp};

    fn ctx() -> StepContext {
        StepContext::new(Timestamp(1), "test")
    }

    fn ins(k: u128, t: i64) -> Update {
        Update::insert_row(Key(k), row![t])
    }

    fn step(op: &mut dyn Operator, input: Vec<Update>) -> Vec<Update> {
        op.step(&mut ctx(), &[&input]).unwrap()
    }

    #[test]
    fn test_tracker_per_instance() {
        let mut tracker = TimeTracker::per_instance();
        tracker.observe(Key(1), 10);
        tracker.observe(Key(2), 3);
        tracker.observe(Key(1), 7);
        assert_eq!(tracker.max_seen(Key(1)), Some(10));
        assert_eq!(tracker.max_seen(Key(2)), Some(3));
        assert_eq!(tracker.max_seen(Key(3)), None);
        assert_eq!(tracker.max_seen_any(), Some(10));
    }

    #[test]
    fn test_gate_threshold_uses_previous_batches() {
        let behavior = TemporalBehavior::new().with_cutoff(5);
        let mut gate = TemporalGate::new(behavior, 1);
        let timed = |k, t| Timed {
            update: ins(k, t),
            time: t,
            instance: Key::ABSENT,
        };
        // Same batch: nothing is late yet
        let out = gate.process("t", vec![vec![timed(1, 20), timed(2, 1)]]);
        assert_eq!(out[0].len(), 2);
        let out = gate.process("t", vec![vec![timed(3, 15), timed(4, 16)]]);
        assert_eq!(out[0].len(), 1);
        assert_eq!(gate.late_dropped(), 1);
        assert_eq!(gate.threshold(Key::ABSENT), Some(15));
    }

    #[test]
    fn test_buffer_releases_after_delay() {
        let mut df = Dataflow::new();
        let t = df.input("t", 1).unwrap();
        df.buffer(t, 0, 10).unwrap();
        let mut op = Buffer {
            time_column: 0,
            gate: TemporalGate::new(TemporalBehavior::new().with_delay(10), 1),
        };
        assert!(step(&mut op, vec![ins(1, 5)]).is_empty());
        assert!(step(&mut op, vec![ins(2, 14)]).is_empty());
        let out = step(&mut op, vec![ins(3, 15)]);
        assert_eq!(out, vec![ins(1, 5)]);
        assert_eq!(op.gate.pending_len(), 2);
    }

    #[test]
    fn test_buffer_cancels_pending() {
        let mut op = Buffer {
            time_column: 0,
            gate: TemporalGate::new(TemporalBehavior::new().with_delay(10), 1),
        };
        step(&mut op, vec![ins(1, 5)]);
        let out = step(&mut op, vec![Update::delete_row(Key(1), row![5i64]), ins(2, 30)]);
        assert!(out.is_empty());
        assert_eq!(op.gate.pending_len(), 1);
    }

    #[test]
    fn test_buffer_keeps_same_time_update() {
        let mut op = Buffer {
            time_column: 0,
            gate: TemporalGate::new(TemporalBehavior::new().with_delay(10), 1),
        };
        step(&mut op, vec![Update::insert_row(Key(1), row![5i64, 100i64])]);
        // Consolidation orders the smaller new row ahead of the retraction
        let update = crate::delta::consolidate(vec![
            Update::delete_row(Key(1), row![5i64, 100i64]),
            Update::insert_row(Key(1), row![5i64, 50i64]),
        ]);
        assert!(update[0].is_insert());
        assert!(step(&mut op, update).is_empty());
        assert_eq!(op.gate.pending_len(), 1);

        let out = step(&mut op, vec![Update::insert_row(Key(2), row![20i64, 0i64])]);
        assert_eq!(out, vec![Update::insert_row(Key(1), row![5i64, 50i64])]);
    }

    #[test]
    fn test_forget_retracts_when_not_keeping() {
        let mut op = Forget {
            time_column: 0,
            gate: TemporalGate::new(TemporalBehavior::new().with_cutoff(10).keep_results(false), 1),
            live: BTreeMap::new(),
        };
        assert_eq!(step(&mut op, vec![ins(1, 5), ins(2, 12)]).len(), 2);
        let out = step(&mut op, vec![ins(3, 16)]);
        assert_eq!(out, vec![ins(3, 16), Update::delete_row(Key(1), row![5i64])]);
        assert_eq!(op.live_len(), 2);
        // Late, so ignored for good
        assert!(step(&mut op, vec![ins(4, 6)]).is_empty());
    }

    #[test]
    fn test_forget_keeps_results() {
        let mut op = Forget {
            time_column: 0,
            gate: TemporalGate::new(TemporalBehavior::new().with_cutoff(10), 1),
            live: BTreeMap::new(),
        };
        step(&mut op, vec![ins(1, 5)]);
        let out = step(&mut op, vec![ins(2, 40)]);
        assert_eq!(out, vec![ins(2, 40)]);
        assert_eq!(op.live_len(), 1);
    }

    #[test]
    fn test_bad_time_is_reported() {
        let mut ctx = ctx();
        let updates = vec![Update::insert_row(Key(1), row!["soon"])];
        assert!(attach_times(&mut ctx, &updates, 0, &[]).is_empty());
        assert_eq!(ctx.into_errors().len(), 1);
    }
}
