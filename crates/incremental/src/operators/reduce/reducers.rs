//! Built-in accumulators.
//!
//! Count and the sums retract arithmetically. Every order-sensitive reducer
//! keeps an ordered multiset so that a removed row can be taken out exactly.

use super::accumulator::{Accumulator, ReducerInput};
use eddy_core::{DataError, DataResult, DataType, Key, Timestamp, Value};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// An ordered bag of items with signed multiplicities.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Multiset<T: Ord> {
    items: BTreeMap<T, i64>,
}

impl<T: Ord> Multiset<T> {
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }

    pub fn single(item: T) -> Self {
        let mut set = Self::new();
        set.add(item, 1);
        set
    }

    pub fn add(&mut self, item: T, count: i64) {
        match self.items.entry(item) {
            Entry::Occupied(mut e) => {
                *e.get_mut() += count;
                if *e.get() == 0 {
                    e.remove();
                }
            }
            Entry::Vacant(e) => {
                if count != 0 {
                    e.insert(count);
                }
            }
        }
    }

    pub fn merge(&mut self, other: Self) {
        for (item, count) in other.items {
            self.add(item, count);
        }
    }

    pub fn subtract(&mut self, other: Self) {
        for (item, count) in other.items {
            self.add(item, -count);
        }
    }

    pub fn first(&self) -> Option<&T> {
        self.items.keys().next()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.keys().next_back()
    }

    pub fn distinct_len(&self) -> usize {
        self.items.len()
    }

    /// Iterates items in order, repeating each by its multiplicity.
    pub fn iter_repeated(&self) -> impl Iterator<Item = &T> {
        self.items
            .iter()
            .flat_map(|(item, &count)| std::iter::repeat(item).take(count.max(0) as usize))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn require_int(value: &Value) -> DataResult<i64> {
    value
        .as_int()
        .ok_or_else(|| DataError::coercion(value, DataType::Int))
}

fn require_float(value: &Value) -> DataResult<f64> {
    value
        .as_float()
        .ok_or_else(|| DataError::coercion(value, DataType::Float))
}

/// Number of rows.
#[derive(Debug)]
pub struct CountAcc(i64);

impl Accumulator for CountAcc {
    const RETRACTABLE: bool = true;

    fn from_row(_input: &ReducerInput<'_>) -> DataResult<Self> {
        Ok(CountAcc(1))
    }

    fn update(&mut self, other: Self) {
        self.0 += other.0;
    }

    fn retract(&mut self, other: Self) -> bool {
        self.0 -= other.0;
        true
    }

    fn compute_result(&self) -> Value {
        Value::Int(self.0)
    }

    fn neutral() -> Option<Self> {
        Some(CountAcc(0))
    }
}

/// Sum of integers.
///
/// The running sum is wider than `i64`, so retractions stay exact; a result
/// outside the `i64` range is an overflow error.
#[derive(Debug)]
pub struct IntSumAcc(i128);

impl Accumulator for IntSumAcc {
    const RETRACTABLE: bool = true;

    fn from_row(input: &ReducerInput<'_>) -> DataResult<Self> {
        require_int(input.value()).map(|v| IntSumAcc(i128::from(v)))
    }

    fn update(&mut self, other: Self) {
        self.0 = self.0.saturating_add(other.0);
    }

    fn retract(&mut self, other: Self) -> bool {
        self.0 = self.0.saturating_sub(other.0);
        true
    }

    fn compute_result(&self) -> Value {
        self.try_result().unwrap_or(Value::Error)
    }

    fn try_result(&self) -> DataResult<Value> {
        i64::try_from(self.0)
            .map(Value::Int)
            .map_err(|_| DataError::Overflow("int_sum"))
    }

    fn neutral() -> Option<Self> {
        Some(IntSumAcc(0))
    }
}

/// Sum of floats.
#[derive(Debug)]
pub struct FloatSumAcc(f64);

impl Accumulator for FloatSumAcc {
    const RETRACTABLE: bool = true;

    fn from_row(input: &ReducerInput<'_>) -> DataResult<Self> {
        require_float(input.value()).map(FloatSumAcc)
    }

    fn update(&mut self, other: Self) {
        self.0 += other.0;
    }

    fn retract(&mut self, other: Self) -> bool {
        self.0 -= other.0;
        true
    }

    fn compute_result(&self) -> Value {
        Value::Float(self.0)
    }

    fn neutral() -> Option<Self> {
        Some(FloatSumAcc(0.0))
    }
}

/// Arithmetic mean.
#[derive(Debug)]
pub struct AvgAcc {
    sum: f64,
    count: i64,
}

impl Accumulator for AvgAcc {
    const RETRACTABLE: bool = true;

    fn from_row(input: &ReducerInput<'_>) -> DataResult<Self> {
        Ok(AvgAcc {
            sum: require_float(input.value())?,
            count: 1,
        })
    }

    fn update(&mut self, other: Self) {
        self.sum += other.sum;
        self.count += other.count;
    }

    fn retract(&mut self, other: Self) -> bool {
        self.sum -= other.sum;
        self.count -= other.count;
        true
    }

    fn compute_result(&self) -> Value {
        if self.count == 0 {
            Value::Null
        } else {
            Value::Float(self.sum / self.count as f64)
        }
    }
}

/// Minimum or maximum over a multiset of values.
#[derive(Debug)]
pub struct ExtremumAcc<const MAX: bool>(Multiset<Value>);

pub type MinAcc = ExtremumAcc<false>;
pub type MaxAcc = ExtremumAcc<true>;

impl<const MAX: bool> Accumulator for ExtremumAcc<MAX> {
    const RETRACTABLE: bool = true;

    fn from_row(input: &ReducerInput<'_>) -> DataResult<Self> {
        Ok(ExtremumAcc(Multiset::single(input.value().clone())))
    }

    fn update(&mut self, other: Self) {
        self.0.merge(other.0);
    }

    fn retract(&mut self, other: Self) -> bool {
        self.0.subtract(other.0);
        true
    }

    fn compute_result(&self) -> Value {
        let extremum = if MAX { self.0.last() } else { self.0.first() };
        extremum.cloned().unwrap_or(Value::Null)
    }
}

/// Key of the row holding the minimum or maximum value.
///
/// Rows sharing the extreme value resolve to the smallest key.
#[derive(Debug)]
pub struct ArgExtremumAcc<const MAX: bool>(Multiset<(Value, Key)>);

pub type ArgMinAcc = ArgExtremumAcc<false>;
pub type ArgMaxAcc = ArgExtremumAcc<true>;

impl<const MAX: bool> Accumulator for ArgExtremumAcc<MAX> {
    const RETRACTABLE: bool = true;

    fn from_row(input: &ReducerInput<'_>) -> DataResult<Self> {
        Ok(ArgExtremumAcc(Multiset::single((
            input.value().clone(),
            input.key,
        ))))
    }

    fn update(&mut self, other: Self) {
        self.0.merge(other.0);
    }

    fn retract(&mut self, other: Self) -> bool {
        self.0.subtract(other.0);
        true
    }

    fn compute_result(&self) -> Value {
        let found = if MAX {
            self.0.last().and_then(|(value, _)| {
                self.0
                    .items
                    .range((value.clone(), Key(0))..)
                    .next()
                    .map(|((_, key), _)| *key)
            })
        } else {
            self.0.first().map(|(_, key)| *key)
        };
        found.map(Value::Pointer).unwrap_or(Value::Null)
    }
}

/// All values of the group as a tuple, in value order.
#[derive(Debug)]
pub struct SortedTupleAcc<const SKIP_NONES: bool>(Multiset<(Value, Key)>);

impl<const SKIP_NONES: bool> Accumulator for SortedTupleAcc<SKIP_NONES> {
    const RETRACTABLE: bool = true;

    fn from_row(input: &ReducerInput<'_>) -> DataResult<Self> {
        let value = input.value();
        if SKIP_NONES && value.is_null() {
            return Ok(SortedTupleAcc(Multiset::new()));
        }
        Ok(SortedTupleAcc(Multiset::single((value.clone(), input.key))))
    }

    fn update(&mut self, other: Self) {
        self.0.merge(other.0);
    }

    fn retract(&mut self, other: Self) -> bool {
        self.0.subtract(other.0);
        true
    }

    fn compute_result(&self) -> Value {
        Value::tuple(self.0.iter_repeated().map(|(value, _)| value.clone()))
    }

    fn neutral() -> Option<Self> {
        Some(SortedTupleAcc(Multiset::new()))
    }
}

/// All values of the group as a tuple, in row key order.
#[derive(Debug)]
pub struct TupleAcc<const SKIP_NONES: bool>(Multiset<(Key, Value)>);

impl<const SKIP_NONES: bool> Accumulator for TupleAcc<SKIP_NONES> {
    const RETRACTABLE: bool = true;

    fn from_row(input: &ReducerInput<'_>) -> DataResult<Self> {
        let value = input.value();
        if SKIP_NONES && value.is_null() {
            return Ok(TupleAcc(Multiset::new()));
        }
        Ok(TupleAcc(Multiset::single((input.key, value.clone()))))
    }

    fn update(&mut self, other: Self) {
        self.0.merge(other.0);
    }

    fn retract(&mut self, other: Self) -> bool {
        self.0.subtract(other.0);
        true
    }

    fn compute_result(&self) -> Value {
        Value::tuple(self.0.iter_repeated().map(|(_, value)| value.clone()))
    }

    fn neutral() -> Option<Self> {
        Some(TupleAcc(Multiset::new()))
    }
}

/// The single distinct value of the group.
///
/// More than one distinct value yields `Value::Error`.
#[derive(Debug)]
pub struct UniqueAcc(Multiset<Value>);

impl Accumulator for UniqueAcc {
    const RETRACTABLE: bool = true;

    fn from_row(input: &ReducerInput<'_>) -> DataResult<Self> {
        Ok(UniqueAcc(Multiset::single(input.value().clone())))
    }

    fn update(&mut self, other: Self) {
        self.0.merge(other.0);
    }

    fn retract(&mut self, other: Self) -> bool {
        self.0.subtract(other.0);
        true
    }

    fn compute_result(&self) -> Value {
        match self.0.distinct_len() {
            0 => Value::Null,
            1 => self.0.first().cloned().unwrap_or(Value::Null),
            _ => Value::Error,
        }
    }
}

/// An arbitrary value of the group; the value of the smallest key.
#[derive(Debug)]
pub struct AnyAcc {
    key: Key,
    value: Value,
}

impl Accumulator for AnyAcc {
    fn from_row(input: &ReducerInput<'_>) -> DataResult<Self> {
        Ok(AnyAcc {
            key: input.key,
            value: input.value().clone(),
        })
    }

    fn update(&mut self, other: Self) {
        if other.key < self.key {
            *self = other;
        }
    }

    fn compute_result(&self) -> Value {
        self.value.clone()
    }
}

/// Value of the row inserted first or last in processing time.
///
/// Rows inserted in the same batch are ordered by key.
#[derive(Debug)]
pub struct ArrivalAcc<const LATEST: bool>(Multiset<(Timestamp, Key, Value)>);

pub type EarliestAcc = ArrivalAcc<false>;
pub type LatestAcc = ArrivalAcc<true>;

impl<const LATEST: bool> Accumulator for ArrivalAcc<LATEST> {
    const RETRACTABLE: bool = true;

    fn from_row(input: &ReducerInput<'_>) -> DataResult<Self> {
        Ok(ArrivalAcc(Multiset::single((
            input.time,
            input.key,
            input.value().clone(),
        ))))
    }

    fn update(&mut self, other: Self) {
        self.0.merge(other.0);
    }

    fn retract(&mut self, other: Self) -> bool {
        self.0.subtract(other.0);
        true
    }

    fn compute_result(&self) -> Value {
        let entry = if LATEST { self.0.last() } else { self.0.first() };
        entry.map(|(_, _, v)| v.clone()).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(key: u128, values: &[Value], time: u64) -> ReducerInput<'_> {
        ReducerInput {
            key: Key(key),
            values,
            time: Timestamp(time),
        }
    }

    fn fold<A: Accumulator>(rows: &[(u128, Value, u64)]) -> A {
        let mut iter = rows.iter();
        let (k, v, t) = iter.next().unwrap();
        let mut acc = A::from_row(&input(*k, std::slice::from_ref(v), *t)).unwrap();
        for (k, v, t) in iter {
            acc.update(A::from_row(&input(*k, std::slice::from_ref(v), *t)).unwrap());
        }
        acc
    }

    fn remove<A: Accumulator>(acc: &mut A, key: u128, value: Value, time: u64) {
        let row = A::from_row(&input(key, std::slice::from_ref(&value), time)).unwrap();
        assert!(acc.retract(row));
    }

    #[test]
    fn test_multiset_add_remove() {
        let mut set = Multiset::new();
        set.add(3, 2);
        set.add(1, 1);
        assert_eq!(set.iter_repeated().copied().collect::<Vec<_>>(), vec![1, 3, 3]);
        set.add(3, -2);
        assert_eq!(set.distinct_len(), 1);
        set.add(1, -1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_sum_retract() {
        let mut acc = fold::<IntSumAcc>(&[(1, Value::Int(5), 0), (2, Value::Int(7), 0)]);
        remove(&mut acc, 1, Value::Int(5), 0);
        assert_eq!(acc.compute_result(), Value::Int(7));
        assert!(IntSumAcc::from_row(&input(1, &[Value::from("x")], 0)).is_err());
    }

    #[test]
    fn test_sum_overflow_is_an_error() {
        let mut acc = fold::<IntSumAcc>(&[(1, Value::Int(i64::MAX), 0), (2, Value::Int(1), 0)]);
        assert_eq!(acc.compute_result(), Value::Error);
        assert!(matches!(acc.try_result(), Err(DataError::Overflow(_))));
        // Back in range once the excess is retracted
        remove(&mut acc, 2, Value::Int(1), 0);
        assert_eq!(acc.compute_result(), Value::Int(i64::MAX));
    }

    #[test]
    fn test_avg() {
        let mut acc = fold::<AvgAcc>(&[(1, Value::Int(2), 0), (2, Value::Float(4.0), 0)]);
        assert_eq!(acc.compute_result(), Value::Float(3.0));
        remove(&mut acc, 1, Value::Int(2), 0);
        remove(&mut acc, 2, Value::Float(4.0), 0);
        assert_eq!(acc.compute_result(), Value::Null);
    }

    #[test]
    fn test_min_max_after_retracting_extremum() {
        let rows = [(1, Value::Int(5), 0), (2, Value::Int(1), 0), (3, Value::Int(9), 0)];
        let mut min = fold::<MinAcc>(&rows);
        let mut max = fold::<MaxAcc>(&rows);
        remove(&mut min, 2, Value::Int(1), 0);
        remove(&mut max, 3, Value::Int(9), 0);
        assert_eq!(min.compute_result(), Value::Int(5));
        assert_eq!(max.compute_result(), Value::Int(5));
    }

    #[test]
    fn test_argmax_ties_pick_smallest_key() {
        let rows = [(7, Value::Int(3), 0), (2, Value::Int(3), 0), (5, Value::Int(1), 0)];
        assert_eq!(fold::<ArgMaxAcc>(&rows).compute_result(), Value::Pointer(Key(2)));
        assert_eq!(fold::<ArgMinAcc>(&rows).compute_result(), Value::Pointer(Key(5)));
    }

    #[test]
    fn test_tuples() {
        let rows = [(2, Value::Int(1), 0), (1, Value::Int(9), 0), (3, Value::Null, 0)];
        assert_eq!(
            fold::<SortedTupleAcc<true>>(&rows).compute_result(),
            Value::tuple([Value::Int(1), Value::Int(9)])
        );
        assert_eq!(
            fold::<TupleAcc<false>>(&rows).compute_result(),
            Value::tuple([Value::Int(9), Value::Int(1), Value::Null])
        );
    }

    #[test]
    fn test_unique() {
        let mut acc = fold::<UniqueAcc>(&[(1, Value::Int(4), 0), (2, Value::Int(4), 0)]);
        assert_eq!(acc.compute_result(), Value::Int(4));
        acc.update(UniqueAcc::from_row(&input(3, &[Value::Int(5)], 0)).unwrap());
        assert_eq!(acc.compute_result(), Value::Error);
    }

    #[test]
    fn test_any_is_not_retractable() {
        let mut acc = fold::<AnyAcc>(&[(4, Value::Int(1), 0), (2, Value::Int(8), 0)]);
        assert_eq!(acc.compute_result(), Value::Int(8));
        let row = AnyAcc::from_row(&input(2, &[Value::Int(8)], 0)).unwrap();
        assert!(!acc.retract(row));
    }

    #[test]
    fn test_earliest_latest() {
        let rows = [(1, Value::from("b"), 5), (2, Value::from("a"), 3), (3, Value::from("c"), 9)];
        assert_eq!(fold::<EarliestAcc>(&rows).compute_result(), Value::from("a"));
        let mut latest = fold::<LatestAcc>(&rows);
        assert_eq!(latest.compute_result(), Value::from("c"));
        remove(&mut latest, 3, Value::from("c"), 9);
        assert_eq!(latest.compute_result(), Value::from("b"));
    }
}
