//! Windows and windowed reduction.

use crate::dataflow::{ColumnId, Dataflow, Operator, TableRef};
use crate::delta::{Delta, Update};
use crate::error_log::StepContext;
use crate::operators::reduce::{GroupReduce, ReducerSpec};
use crate::operators::temporal::{attach_times, TemporalBehavior, TemporalGate, TimeTracker, Timed};
use eddy_core::{Error, Key, Result, Row, Value};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bounds of one window, `(start, end)`.
pub type Bounds = (i64, i64);

/// A window shape over an event-time axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Window {
    /// Non-overlapping windows `[start, start + size)`
    Tumbling { size: i64, offset: i64 },
    /// Windows `[start, start + duration)` starting every `hop`
    Sliding { hop: i64, duration: i64, offset: i64 },
    /// Maximal runs of times whose neighbours are less than `max_gap` apart,
    /// bounded by their first and last time
    Session { max_gap: i64 },
}

impl Window {
    pub fn tumbling(size: i64) -> Self {
        Window::Tumbling { size, offset: 0 }
    }

    pub fn sliding(hop: i64, duration: i64) -> Self {
        Window::Sliding {
            hop,
            duration,
            offset: 0,
        }
    }

    pub fn session(max_gap: i64) -> Self {
        Window::Session { max_gap }
    }

    /// Shifts the window grid. No effect on sessions.
    pub fn with_offset(self, offset: i64) -> Self {
        match self {
            Window::Tumbling { size, .. } => Window::Tumbling { size, offset },
            Window::Sliding { hop, duration, .. } => Window::Sliding {
                hop,
                duration,
                offset,
            },
            session => session,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            Window::Tumbling { size, .. } => size > 0,
            Window::Sliding { hop, duration, .. } => hop > 0 && duration > 0,
            Window::Session { max_gap } => max_gap > 0,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::invalid_operation(format!("invalid window {self:?}")))
        }
    }

    #[inline]
    pub fn is_session(&self) -> bool {
        matches!(self, Window::Session { .. })
    }

    /// Windows containing `time`, in increasing start order.
    ///
    /// Sessions depend on the other times, so a lone time maps to the
    /// degenerate session `(time, time)`; use [`SessionIndex`] instead.
    pub fn assign(&self, time: i64) -> Vec<Bounds> {
        match *self {
            Window::Tumbling { size, offset } => {
                let start = grid_start(time, offset, size);
                vec![(start, start.saturating_add(size))]
            }
            Window::Sliding {
                hop,
                duration,
                offset,
            } => {
                let mut start = grid_start(time, offset, hop);
                let earliest = time.saturating_sub(duration);
                let mut windows = Vec::new();
                while start > earliest {
                    windows.push((start, start.saturating_add(duration)));
                    start = start.saturating_sub(hop);
                }
                windows.reverse();
                windows
            }
            Window::Session { .. } => vec![(time, time)],
        }
    }

    /// Whether a window ending at `end` can still receive records once
    /// everything at or below `threshold` is ignored.
    pub fn is_closed(&self, end: i64, threshold: i64) -> bool {
        self.horizon(end) <= threshold
    }

    /// Once every time at or below the horizon is ignored, the window
    /// ending at `end` is final.
    pub fn horizon(&self, end: i64) -> i64 {
        match *self {
            Window::Session { max_gap } => end.saturating_add(max_gap),
            _ => end,
        }
    }
}

/// Last grid point `offset + k * step` at or below `time`.
fn grid_start(time: i64, offset: i64, step: i64) -> i64 {
    let shift = (i128::from(time) - i128::from(offset)).rem_euclid(i128::from(step.max(1)));
    // `shift` is below `step`, so it fits
    time.saturating_sub(shift as i64)
}

/// A change of the session a record belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct Reassignment<V> {
    pub key: Key,
    pub old: Option<(Bounds, V)>,
    pub new: Option<(Bounds, V)>,
}

/// Gap-based sessions that merge and split as records come and go.
///
/// Records are grouped per instance. After a round of inserts and removals,
/// [`reassign`](SessionIndex::reassign) recomputes the sessions of the touched
/// instances and reports every record whose session changed.
#[derive(Debug)]
pub struct SessionIndex<V> {
    max_gap: i64,
    instances: HashMap<Key, BTreeMap<(i64, Key), V>>,
    assigned: HashMap<Key, (Bounds, V)>,
    dirty: HashSet<Key>,
    removed: Vec<Key>,
}

impl<V: Clone + PartialEq> SessionIndex<V> {
    pub fn new(max_gap: i64) -> Self {
        Self {
            max_gap,
            instances: HashMap::new(),
            assigned: HashMap::new(),
            dirty: HashSet::new(),
            removed: Vec::new(),
        }
    }

    pub fn insert(&mut self, instance: Key, time: i64, key: Key, value: V) {
        self.instances
            .entry(instance)
            .or_default()
            .insert((time, key), value);
        self.dirty.insert(instance);
    }

    pub fn remove(&mut self, instance: Key, time: i64, key: Key) -> Option<V> {
        let entries = self.instances.get_mut(&instance)?;
        let value = entries.remove(&(time, key))?;
        if entries.is_empty() {
            self.instances.remove(&instance);
        }
        self.dirty.insert(instance);
        self.removed.push(key);
        Some(value)
    }

    /// Current session of a record.
    pub fn session_of(&self, key: Key) -> Option<Bounds> {
        self.assigned.get(&key).map(|(bounds, _)| *bounds)
    }

    pub fn len(&self) -> usize {
        self.instances.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn sessions(&self, instance: &Key) -> Vec<(Bounds, Vec<(i64, Key)>)> {
        let mut sessions: Vec<(Bounds, Vec<(i64, Key)>)> = Vec::new();
        let Some(entries) = self.instances.get(instance) else {
            return sessions;
        };
        for &slot in entries.keys() {
            match sessions.last_mut() {
                Some(((_, end), members)) if slot.0.saturating_sub(*end) < self.max_gap => {
                    *end = slot.0;
                    members.push(slot);
                }
                _ => sessions.push(((slot.0, slot.0), vec![slot])),
            }
        }
        sessions
    }

    /// Recomputes the touched instances and returns the changed records,
    /// ordered by key.
    pub fn reassign(&mut self) -> Vec<Reassignment<V>> {
        let mut dirty: Vec<Key> = self.dirty.drain().collect();
        dirty.sort();
        let mut seen = HashSet::new();
        let mut changes = Vec::new();
        for instance in dirty {
            for (bounds, members) in self.sessions(&instance) {
                for slot in members {
                    let key = slot.1;
                    seen.insert(key);
                    let Some(value) = self
                        .instances
                        .get(&instance)
                        .and_then(|entries| entries.get(&slot))
                        .cloned()
                    else {
                        continue;
                    };
                    let unchanged = self
                        .assigned
                        .get(&key)
                        .is_some_and(|(b, v)| *b == bounds && *v == value);
                    if !unchanged {
                        let old = self.assigned.insert(key, (bounds, value.clone()));
                        changes.push(Reassignment {
                            key,
                            old,
                            new: Some((bounds, value)),
                        });
                    }
                }
            }
        }
        for key in std::mem::take(&mut self.removed) {
            if seen.contains(&key) {
                continue;
            }
            if let Some(old) = self.assigned.remove(&key) {
                changes.push(Reassignment {
                    key,
                    old: Some(old),
                    new: None,
                });
            }
        }
        changes.sort_by_key(|change| change.key);
        changes
    }

    /// Forgets whole sessions for which `closed` holds. Their records leave
    /// silently.
    pub fn evict<F>(&mut self, mut closed: F) -> usize
    where
        F: FnMut(Key, Bounds) -> bool,
    {
        let instances: Vec<Key> = self.instances.keys().copied().collect();
        let mut evicted = 0;
        for instance in instances {
            for (bounds, members) in self.sessions(&instance) {
                if !closed(instance, bounds) {
                    continue;
                }
                if let Some(entries) = self.instances.get_mut(&instance) {
                    entries.retain(|(t, _), _| *t < bounds.0 || *t > bounds.1);
                }
                for (_, key) in members {
                    self.assigned.remove(&key);
                    evicted += 1;
                }
            }
            if self.instances.get(&instance).is_some_and(BTreeMap::is_empty) {
                self.instances.remove(&instance);
            }
        }
        evicted
    }
}

/// Converts a time on the event axis back to a value of the time column's
/// variant.
pub fn time_value(template: &Value, time: i64) -> Value {
    match template {
        Value::DateTime(_) => Value::DateTime(time),
        Value::Duration(_) => Value::Duration(time),
        _ => Value::Int(time),
    }
}

/// Extends a row with its window bounds, keyed per window.
pub(crate) fn windowed(key: Key, row: &Row, time_column: ColumnId, bounds: Bounds, diff: i32) -> Update {
    let template = row.get_or_null(time_column);
    let row = row.with_appended([
        time_value(&template, bounds.0),
        time_value(&template, bounds.1),
    ]);
    Delta::new((key.with_salt(&Value::Int(bounds.0)), row), diff)
}

/// Window assignment followed by a per-window groupby-reduce.
pub struct WindowBy {
    time_column: ColumnId,
    window: Window,
    instance: Vec<ColumnId>,
    gate: TemporalGate,
    sessions: Option<SessionIndex<Row>>,
    reduce: GroupReduce,
}

impl WindowBy {
    fn assign(&mut self, released: Vec<Timed>) -> Vec<Update> {
        let mut out = Vec::new();
        match &mut self.sessions {
            None => {
                for item in released {
                    for bounds in self.window.assign(item.time) {
                        out.push(windowed(
                            item.update.key(),
                            item.update.row(),
                            self.time_column,
                            bounds,
                            item.update.diff,
                        ));
                    }
                }
            }
            Some(sessions) => {
                let mut released = released;
                released.sort_by_key(|item| item.update.is_insert());
                for item in released {
                    let key = item.update.key();
                    if item.update.is_delete() {
                        sessions.remove(item.instance, item.time, key);
                    } else {
                        sessions.insert(item.instance, item.time, key, item.update.row().clone());
                    }
                }
                for change in sessions.reassign() {
                    if let Some((bounds, row)) = change.old {
                        out.push(windowed(change.key, &row, self.time_column, bounds, -1));
                    }
                    if let Some((bounds, row)) = change.new {
                        out.push(windowed(change.key, &row, self.time_column, bounds, 1));
                    }
                }
            }
        }
        out
    }
}

impl Operator for WindowBy {
    fn name(&self) -> &str {
        "windowby"
    }

    fn step(&mut self, ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let timed = attach_times(ctx, inputs[0], self.time_column, &self.instance);
        let released = self.gate.process("windowby", vec![timed]);
        let assigned = self.assign(released.into_iter().flatten().collect());
        let mut out = self.reduce.step(ctx, &[&assigned])?;

        if self.gate.behavior().cutoff.is_some() {
            let n = self.instance.len();
            let window = self.window;
            let gate = &self.gate;
            let instance_of = |values: &[Value]| {
                if n == 0 {
                    Key::ABSENT
                } else {
                    Key::for_values(&values[..n])
                }
            };
            let evicted = self.reduce.evict_where(|values| {
                let end = values.get(n + 1).and_then(Value::as_time);
                match (gate.threshold(instance_of(values)), end) {
                    (Some(threshold), Some(end)) => window.is_closed(end, threshold),
                    _ => false,
                }
            });
            if let Some(sessions) = &mut self.sessions {
                sessions.evict(|instance, (_, end)| {
                    gate.threshold(instance)
                        .is_some_and(|threshold| window.is_closed(end, threshold))
                });
            }
            if !gate.behavior().keep_results {
                out.extend(
                    evicted
                        .into_iter()
                        .map(|(key, row)| Update::delete_row(key, row)),
                );
            }
        }
        Ok(out)
    }
}

impl Dataflow {
    /// Assigns rows to windows over `time_column` and reduces every window,
    /// separately per value of the `instance` columns.
    ///
    /// Output rows hold the instance values, `window_start`, `window_end`
    /// and one column per reducer.
    pub fn windowby(
        &mut self,
        table: TableRef,
        time_column: ColumnId,
        window: Window,
        instance: &[ColumnId],
        reducers: Vec<ReducerSpec>,
        behavior: TemporalBehavior,
    ) -> Result<TableRef> {
        window.validate()?;
        table.check_column(time_column)?;
        table.check_columns(instance)?;
        for spec in &reducers {
            table.check_columns(&spec.args)?;
        }
        let mut group_by = instance.to_vec();
        group_by.extend([table.arity, table.arity + 1]);
        let arity = group_by.len() + reducers.len();
        let tracker = if instance.is_empty() {
            TimeTracker::new()
        } else {
            TimeTracker::per_instance()
        };
        let op = WindowBy {
            time_column,
            window,
            instance: instance.to_vec(),
            gate: TemporalGate::with_tracker(behavior, 1, tracker),
            sessions: match window {
                Window::Session { max_gap } => Some(SessionIndex::new(max_gap)),
                _ => None,
            },
            reduce: GroupReduce::new(group_by, reducers, false),
        };
        self.add_operator(&[table], arity, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::{row, Timestamp};

    #[test]
    fn test_tumbling_assign() {
        let w = Window::tumbling(10);
        assert_eq!(w.assign(0), vec![(0, 10)]);
        assert_eq!(w.assign(19), vec![(10, 20)]);
        assert_eq!(w.assign(-1), vec![(-10, 0)]);
        assert_eq!(w.with_offset(3).assign(2), vec![(-7, 3)]);
    }

    #[test]
    fn test_sliding_assign() {
        let w = Window::sliding(5, 10);
        assert_eq!(w.assign(12), vec![(5, 15), (10, 20)]);
        assert_eq!(w.assign(10), vec![(5, 15), (10, 20)]);
        assert_eq!(Window::sliding(10, 5).assign(7), Vec::<Bounds>::new());
    }

    #[test]
    fn test_assign_near_time_limits() {
        // Ends past the limit saturate
        assert_eq!(Window::tumbling(10).assign(i64::MAX), vec![(i64::MAX - 7, i64::MAX)]);
        let (start, _) = Window::tumbling(10).with_offset(7).assign(i64::MIN)[0];
        assert_eq!(start, i64::MIN);

        let windows = Window::sliding(4, 10).assign(i64::MAX);
        assert_eq!(windows, vec![(i64::MAX - 7, i64::MAX), (i64::MAX - 3, i64::MAX)]);
        assert_eq!(
            Window::sliding(4, 10).assign(i64::MIN + 20),
            vec![(i64::MIN + 12, i64::MIN + 22), (i64::MIN + 16, i64::MIN + 26), (i64::MIN + 20, i64::MIN + 30)]
        );
    }

    #[test]
    fn test_validate() {
        assert!(Window::tumbling(0).validate().is_err());
        assert!(Window::session(3).validate().is_ok());
    }

    #[test]
    fn test_sessions_merge_and_split() {
        let mut index = SessionIndex::new(6);
        let i = Key::ABSENT;
        index.insert(i, 1, Key(1), "a");
        index.insert(i, 10, Key(2), "b");
        let changes = index.reassign();
        assert_eq!(changes.len(), 2);
        assert_eq!(index.session_of(Key(2)), Some((10, 10)));

        // Bridges both sessions
        index.insert(i, 5, Key(3), "c");
        let changes = index.reassign();
        assert_eq!(changes.len(), 3);
        assert_eq!(index.session_of(Key(1)), Some((1, 10)));

        index.remove(i, 5, Key(3));
        let changes = index.reassign();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[2].new, None);
        assert_eq!(index.session_of(Key(1)), Some((1, 1)));
    }

    #[test]
    fn test_session_evict() {
        let mut index = SessionIndex::new(2);
        index.insert(Key::ABSENT, 1, Key(1), ());
        index.insert(Key::ABSENT, 9, Key(2), ());
        index.reassign();
        assert_eq!(index.evict(|_, (_, end)| end < 5), 1);
        assert_eq!(index.len(), 1);
    }

    fn windowby(window: Window, behavior: TemporalBehavior) -> WindowBy {
        let mut df = Dataflow::new();
        let t = df.input("t", 2).unwrap();
        df.windowby(t, 0, window, &[], vec![ReducerSpec::count()], behavior)
            .unwrap();
        WindowBy {
            time_column: 0,
            window,
            instance: Vec::new(),
            gate: TemporalGate::new(behavior, 1),
            sessions: match window {
                Window::Session { max_gap } => Some(SessionIndex::new(max_gap)),
                _ => None,
            },
            reduce: GroupReduce::new(vec![2, 3], vec![ReducerSpec::count()], false),
        }
    }

    fn step(op: &mut WindowBy, input: Vec<Update>) -> Vec<Update> {
        op.step(&mut StepContext::new(Timestamp(1), "windowby"), &[&input])
            .unwrap()
    }

    #[test]
    fn test_sliding_counts() {
        let mut op = windowby(Window::sliding(5, 10), TemporalBehavior::new());
        let out = step(
            &mut op,
            vec![
                Update::insert_row(Key(1), row![12i64, "x"]),
                Update::insert_row(Key(2), row![17i64, "y"]),
            ],
        );
        let mut rows: Vec<Row> = out.iter().map(|u| u.row().clone()).collect();
        rows.sort();
        assert_eq!(
            rows,
            vec![
                row![5i64, 15i64, 1i64],
                row![10i64, 20i64, 2i64],
                row![15i64, 25i64, 1i64]
            ]
        );
    }

    #[test]
    fn test_session_windowby() {
        let mut op = windowby(Window::session(3), TemporalBehavior::new());
        step(&mut op, vec![Update::insert_row(Key(1), row![1i64, "a"])]);
        step(&mut op, vec![Update::insert_row(Key(2), row![8i64, "b"])]);
        let out = step(&mut op, vec![Update::insert_row(Key(3), row![3i64, "c"])]);
        assert!(out.contains(&Update::delete_row(
            Key::for_values(&[1i64.into(), 1i64.into()]),
            row![1i64, 1i64, 1i64]
        )));
        assert!(out.contains(&Update::insert_row(
            Key::for_values(&[1i64.into(), 3i64.into()]),
            row![1i64, 3i64, 2i64]
        )));
    }

    #[test]
    fn test_cutoff_evicts_and_drops_late() {
        let behavior = TemporalBehavior::new().with_cutoff(5).keep_results(false);
        let mut op = windowby(Window::tumbling(10), behavior);
        step(&mut op, vec![Update::insert_row(Key(1), row![3i64, "a"])]);
        let out = step(&mut op, vec![Update::insert_row(Key(2), row![16i64, "b"])]);
        assert!(out.contains(&Update::delete_row(
            Key::for_values(&[0i64.into(), 10i64.into()]),
            row![0i64, 10i64, 1i64]
        )));
        assert!(step(&mut op, vec![Update::insert_row(Key(3), row![4i64, "c"])]).is_empty());
        assert_eq!(op.gate.late_dropped(), 1);
    }
}
