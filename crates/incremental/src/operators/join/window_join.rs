//! Window join: an equality join run separately inside every window.

use super::core::{JoinCore, JoinEntry, JoinType, Side};
use super::index::EquiIndex;
use super::{admit, split_on};
use crate::dataflow::{ColumnId, Dataflow, Operator, TableRef};
use crate::delta::Update;
use crate::error_log::StepContext;
use crate::operators::temporal::{TemporalBehavior, TemporalGate};
use crate::operators::window::{time_value, Bounds, SessionIndex, Window};
use eddy_core::{Key, Result, Row, Value};

/// Builds the entry of a row inside one window.
///
/// The window start joins the equality key, and salts the row key so that
/// a row belonging to several windows has one entry per window.
fn window_entry(
    window: &Window,
    on: &[ColumnId],
    time_column: ColumnId,
    key: Key,
    row: &Row,
    bounds: Bounds,
) -> JoinEntry {
    let template = row.get_or_null(time_column);
    let start = Value::Int(bounds.0);
    let mut join_key = row.extract(on);
    join_key.push(start.clone());
    JoinEntry {
        key: key.with_salt(&start),
        row: row.clone(),
        join_key,
        time: window.horizon(bounds.1),
        window: Some([
            time_value(&template, bounds.0),
            time_value(&template, bounds.1),
        ]),
    }
}

/// Window join operator.
pub struct WindowJoin {
    core: JoinCore<EquiIndex>,
    on: [Vec<ColumnId>; 2],
    time: [ColumnId; 2],
    window: Window,
    gate: TemporalGate,
    sessions: Option<SessionIndex<(Side, Key, Row)>>,
}

impl WindowJoin {
    pub fn core(&self) -> &JoinCore<EquiIndex> {
        &self.core
    }
}

impl Operator for WindowJoin {
    fn name(&self) -> &str {
        "window_join"
    }

    fn step(&mut self, ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let admitted = admit(ctx, inputs, Some(self.time), Some(&mut self.gate), "window_join");
        let mut deletes: Vec<(Side, JoinEntry)> = Vec::new();
        let mut inserts: Vec<(Side, JoinEntry)> = Vec::new();
        let window = self.window;

        match &mut self.sessions {
            None => {
                for (side, items) in [Side::Left, Side::Right].into_iter().zip(admitted) {
                    let (on, time) = (&self.on[side.index()], self.time[side.index()]);
                    for item in items {
                        for bounds in window.assign(item.time) {
                            let entry =
                                window_entry(&window, on, time, item.update.key(), item.update.row(), bounds);
                            if item.update.is_delete() {
                                deletes.push((side, entry));
                            } else {
                                inserts.push((side, entry));
                            }
                        }
                    }
                }
            }
            Some(sessions) => {
                for (side, mut items) in [Side::Left, Side::Right].into_iter().zip(admitted) {
                    let side_salt = Value::Int(side.index() as i64);
                    items.sort_by_key(|item| item.update.is_insert());
                    for item in items {
                        let (key, row) = item.update.data;
                        let instance = Key::for_values(&row.extract(&self.on[side.index()]));
                        let slot_key = key.with_salt(&side_salt);
                        if item.update.diff < 0 {
                            sessions.remove(instance, item.time, slot_key);
                        } else {
                            sessions.insert(instance, item.time, slot_key, (side, key, row));
                        }
                    }
                }
                for change in sessions.reassign() {
                    if let Some((bounds, (side, key, row))) = change.old {
                        let (on, time) = (&self.on[side.index()], self.time[side.index()]);
                        deletes.push((side, window_entry(&window, on, time, key, &row, bounds)));
                    }
                    if let Some((bounds, (side, key, row))) = change.new {
                        let (on, time) = (&self.on[side.index()], self.time[side.index()]);
                        inserts.push((side, window_entry(&window, on, time, key, &row, bounds)));
                    }
                }
            }
        }

        let mut out = Vec::new();
        for (side, entry) in deletes {
            self.core
                .delete(side, entry.key, &entry.join_key, entry.time, &mut out);
        }
        for (side, entry) in inserts {
            self.core.insert(side, entry, &mut out);
        }
        if let Some(threshold) = self.gate.threshold_any() {
            let retract = !self.gate.behavior().keep_results;
            self.core.evict(threshold, retract, &mut out);
            if let Some(sessions) = &mut self.sessions {
                sessions.evict(|_, (_, end)| window.is_closed(end, threshold));
            }
        }
        Ok(out)
    }
}

impl Dataflow {
    /// Joins rows that share a window, separately per window.
    ///
    /// A row in several windows joins once per window. Output rows end with
    /// `window_start` and `window_end`.
    #[allow(clippy::too_many_arguments)]
    pub fn window_join(
        &mut self,
        left: TableRef,
        right: TableRef,
        time: (ColumnId, ColumnId),
        window: Window,
        on: &[(ColumnId, ColumnId)],
        join_type: JoinType,
        behavior: TemporalBehavior,
    ) -> Result<TableRef> {
        window.validate()?;
        let on = split_on(&left, &right, on)?;
        left.check_column(time.0)?;
        right.check_column(time.1)?;
        let arity = left.arity + right.arity + 2;
        let op = WindowJoin {
            core: JoinCore::new(EquiIndex::new(), join_type, left.arity, right.arity),
            on,
            time: [time.0, time.1],
            window,
            gate: TemporalGate::new(behavior, 2),
            sessions: match window {
                Window::Session { max_gap } => Some(SessionIndex::new(max_gap)),
                _ => None,
            },
        };
        self.add_operator(&[left, right], arity, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::{row, Timestamp};

    fn op(window: Window, join_type: JoinType) -> WindowJoin {
        WindowJoin {
            core: JoinCore::new(EquiIndex::new(), join_type, 2, 2),
            on: [vec![1], vec![1]],
            time: [0, 0],
            window,
            gate: TemporalGate::new(TemporalBehavior::new(), 2),
            sessions: match window {
                Window::Session { max_gap } => Some(SessionIndex::new(max_gap)),
                _ => None,
            },
        }
    }

    fn step(op: &mut WindowJoin, left: Vec<Update>, right: Vec<Update>) -> Vec<Update> {
        op.step(&mut StepContext::new(Timestamp(1), "window_join"), &[&left, &right])
            .unwrap()
    }

    #[test]
    fn test_sliding_join_once_per_window() {
        let mut op = op(Window::sliding(5, 10), JoinType::Inner);
        let out = step(
            &mut op,
            vec![Update::insert_row(Key(1), row![12i64, "k"])],
            vec![Update::insert_row(Key(2), row![13i64, "k"])],
        );
        let mut rows: Vec<Row> = out.iter().map(|u| u.row().clone()).collect();
        rows.sort();
        assert_eq!(
            rows,
            vec![
                row![12i64, "k", 13i64, "k", 5i64, 15i64],
                row![12i64, "k", 13i64, "k", 10i64, 20i64],
            ]
        );
    }

    #[test]
    fn test_tumbling_requires_same_window() {
        let mut op = op(Window::tumbling(10), JoinType::Left);
        let out = step(
            &mut op,
            vec![Update::insert_row(Key(1), row![3i64, "k"])],
            vec![Update::insert_row(Key(2), row![12i64, "k"])],
        );
        assert_eq!(
            out,
            vec![Update::insert_row(
                Key::for_pair(Key(1).with_salt(&Value::Int(0)), Key::ABSENT),
                Row::new(vec![3i64.into(), "k".into(), Value::Null, Value::Null, 0i64.into(), 10i64.into()])
            )]
        );
    }

    #[test]
    fn test_session_join_follows_merges() {
        let mut op = op(Window::session(5), JoinType::Inner);
        let out = step(
            &mut op,
            vec![Update::insert_row(Key(1), row![1i64, "k"])],
            vec![Update::insert_row(Key(2), row![4i64, "k"])],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].row(), &row![1i64, "k", 4i64, "k", 1i64, 4i64]);

        let out = step(&mut op, Vec::new(), vec![Update::insert_row(Key(3), row![7i64, "k"])]);
        let removed: Vec<&Row> = out.iter().filter(|u| u.is_delete()).map(|u| u.row()).collect();
        assert_eq!(removed, vec![&row![1i64, "k", 4i64, "k", 1i64, 4i64]]);
        let added: Vec<&Update> = out.iter().filter(|u| u.is_insert()).collect();
        assert_eq!(added.len(), 2);
        assert!(added.iter().all(|u| u.row().get(5) == Some(&Value::Int(7))));
    }
}
