//! Joins.
//!
//! The equality, interval and window joins share [`JoinCore`], which keeps
//! the per-entry match counts needed by the outer variants over a
//! [`MatchIndex`]. The asof join picks a single partner per left row and has
//! its own state.
//!
//! Output rows are `left ++ right` (window joins append `window_start` and
//! `window_end`), padded with nulls for the missing side. A pair is keyed by
//! `Key::for_pair(left, right)`, an unmatched row by pairing its key with
//! [`Key::ABSENT`](eddy_core::Key::ABSENT).

mod asof;
mod core;
mod index;
mod window_join;

pub use self::asof::{AsofDirection, AsofJoin, AsofJoinType, AsofOptions};
pub use self::core::{JoinCore, JoinEntry, JoinType, MatchIndex, Side};
pub use self::index::{EquiIndex, IntervalIndex};
pub use self::window_join::WindowJoin;

use crate::dataflow::{ColumnId, Dataflow, Operator, TableRef};
use crate::delta::Update;
use crate::error_log::StepContext;
use crate::operators::temporal::{attach_times, TemporalBehavior, TemporalGate, Timed};
use eddy_core::{Key, Result};

/// Splits `(left, right)` column pairs and checks them against both tables.
pub(crate) fn split_on(
    left: &TableRef,
    right: &TableRef,
    on: &[(ColumnId, ColumnId)],
) -> Result<[Vec<ColumnId>; 2]> {
    let (l, r): (Vec<_>, Vec<_>) = on.iter().copied().unzip();
    left.check_columns(&l)?;
    right.check_columns(&r)?;
    Ok([l, r])
}

/// Reads both inputs, with event times when `time` is set, and passes them
/// through the gate.
pub(crate) fn admit(
    ctx: &mut StepContext,
    inputs: &[&[Update]],
    time: Option<[ColumnId; 2]>,
    gate: Option<&mut TemporalGate>,
    operator: &str,
) -> Vec<Vec<Timed>> {
    let timed: Vec<Vec<Timed>> = match time {
        Some(columns) => (0..2)
            .map(|i| attach_times(ctx, inputs[i], columns[i], &[]))
            .collect(),
        None => (0..2)
            .map(|i| {
                inputs[i]
                    .iter()
                    .map(|update| Timed {
                        update: update.clone(),
                        time: 0,
                        instance: Key::ABSENT,
                    })
                    .collect()
            })
            .collect(),
    };
    match gate {
        Some(gate) => gate.process(operator, timed),
        None => timed,
    }
}

/// Equality or interval join operator.
pub struct JoinOperator<I> {
    name: &'static str,
    core: JoinCore<I>,
    on: [Vec<ColumnId>; 2],
    time: Option<[ColumnId; 2]>,
    gate: Option<TemporalGate>,
}

impl<I: MatchIndex> JoinOperator<I> {
    pub fn core(&self) -> &JoinCore<I> {
        &self.core
    }
}

impl<I: MatchIndex + 'static> Operator for JoinOperator<I> {
    fn name(&self) -> &str {
        self.name
    }

    fn step(&mut self, ctx: &mut StepContext, inputs: &[&[Update]]) -> Result<Vec<Update>> {
        let admitted = admit(ctx, inputs, self.time, self.gate.as_mut(), self.name);
        let mut out = Vec::new();
        // Retractions first, so that an updated row leaves before it returns
        for (side, items) in [Side::Left, Side::Right].into_iter().zip(&admitted) {
            for item in items.iter().filter(|item| item.update.is_delete()) {
                let join_key = item.update.row().extract(&self.on[side.index()]);
                self.core
                    .delete(side, item.update.key(), &join_key, item.time, &mut out);
            }
        }
        for (side, items) in [Side::Left, Side::Right].into_iter().zip(admitted) {
            for item in items.into_iter().filter(|item| item.update.is_insert()) {
                let (key, row) = item.update.data;
                let join_key = row.extract(&self.on[side.index()]);
                self.core
                    .insert(side, JoinEntry::new(key, row, join_key, item.time), &mut out);
            }
        }
        if let Some(gate) = &self.gate {
            if let Some(threshold) = gate.threshold_any() {
                let retract = !gate.behavior().keep_results;
                self.core.evict(threshold, retract, &mut out);
            }
        }
        Ok(out)
    }
}

impl Dataflow {
    /// Joins two tables on equal values of the `(left, right)` column pairs.
    pub fn join(
        &mut self,
        left: TableRef,
        right: TableRef,
        on: &[(ColumnId, ColumnId)],
        join_type: JoinType,
    ) -> Result<TableRef> {
        let on = split_on(&left, &right, on)?;
        let arity = left.arity + right.arity;
        self.add_operator(
            &[left, right],
            arity,
            JoinOperator {
                name: "join",
                core: JoinCore::new(EquiIndex::new(), join_type, left.arity, right.arity),
                on,
                time: None,
                gate: None,
            },
        )
    }

    /// Joins rows whose times satisfy `lower <= t_right - t_left <= upper`,
    /// in addition to the equality conditions.
    #[allow(clippy::too_many_arguments)]
    pub fn interval_join(
        &mut self,
        left: TableRef,
        right: TableRef,
        time: (ColumnId, ColumnId),
        bounds: (i64, i64),
        on: &[(ColumnId, ColumnId)],
        join_type: JoinType,
        behavior: TemporalBehavior,
    ) -> Result<TableRef> {
        let on = split_on(&left, &right, on)?;
        left.check_column(time.0)?;
        right.check_column(time.1)?;
        if bounds.0 > bounds.1 {
            return Err(eddy_core::Error::invalid_operation(format!(
                "interval lower bound {} exceeds upper bound {}",
                bounds.0, bounds.1
            )));
        }
        let arity = left.arity + right.arity;
        let index = IntervalIndex::new(bounds.0, bounds.1);
        self.add_operator(
            &[left, right],
            arity,
            JoinOperator {
                name: "interval_join",
                core: JoinCore::new(index, join_type, left.arity, right.arity),
                on,
                time: Some([time.0, time.1]),
                gate: Some(TemporalGate::new(behavior, 2)),
            },
        )
    }
}
