//! Accumulator abstraction for groupby-reduce.
//!
//! Reducers are written against the typed [`Accumulator`] trait. The
//! operator stores them type-erased as [`AccumulatorState`] trait objects and
//! creates them through a [`ReducerFactory`].

use eddy_core::{DataResult, Key, Timestamp, Value};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// The contribution of a single row to a reducer.
#[derive(Clone, Copy, Debug)]
pub struct ReducerInput<'a> {
    /// Key of the contributing row
    pub key: Key,
    /// Values of the reducer's argument columns
    pub values: &'a [Value],
    /// Processing time at which the row was inserted
    pub time: Timestamp,
}

impl<'a> ReducerInput<'a> {
    /// Returns the first argument, or `Null` if there is none.
    pub fn value(&self) -> &'a Value {
        self.values.first().unwrap_or(&Value::Null)
    }
}

/// Per-group aggregation state.
///
/// `update` must be associative and commutative, so states can be merged in
/// any batch order. Retraction is optional: an accumulator that cannot
/// retract leaves `RETRACTABLE` false, and the owning group is then rebuilt
/// from its buffered rows whenever a row leaves it. That rebuild is the slow
/// path, proportional to the group size.
pub trait Accumulator: Sized + Send + 'static {
    /// Whether `retract` is implemented.
    const RETRACTABLE: bool = false;

    /// Creates the state of a single row.
    fn from_row(input: &ReducerInput<'_>) -> DataResult<Self>;

    /// Merges another state into this one.
    fn update(&mut self, other: Self);

    /// Removes a state previously merged in. Returns false if unsupported.
    fn retract(&mut self, _other: Self) -> bool {
        false
    }

    /// Computes the reducer result.
    fn compute_result(&self) -> Value;

    /// Like `compute_result`, but names the row-level error behind an
    /// `Error` result.
    fn try_result(&self) -> DataResult<Value> {
        Ok(self.compute_result())
    }

    /// State of a group with no rows, if the reducer defines one.
    fn neutral() -> Option<Self> {
        None
    }
}

/// Object-safe view of an accumulator.
pub trait AccumulatorState: Send {
    fn update_boxed(&mut self, other: Box<dyn AccumulatorState>);

    fn retract_boxed(&mut self, other: Box<dyn AccumulatorState>) -> bool;

    fn result(&self) -> Value;

    fn try_result(&self) -> DataResult<Value>;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<A: Accumulator> AccumulatorState for A {
    fn update_boxed(&mut self, other: Box<dyn AccumulatorState>) {
        if let Ok(other) = other.into_any().downcast::<A>() {
            self.update(*other);
        }
    }

    fn retract_boxed(&mut self, other: Box<dyn AccumulatorState>) -> bool {
        match other.into_any().downcast::<A>() {
            Ok(other) => A::RETRACTABLE && self.retract(*other),
            Err(_) => false,
        }
    }

    fn result(&self) -> Value {
        self.compute_result()
    }

    fn try_result(&self) -> DataResult<Value> {
        Accumulator::try_result(self)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

type MakeFn = dyn Fn(&ReducerInput<'_>) -> DataResult<Box<dyn AccumulatorState>> + Send + Sync;
type NeutralFn = dyn Fn() -> Option<Box<dyn AccumulatorState>> + Send + Sync;

/// Creates type-erased accumulator states.
#[derive(Clone)]
pub struct ReducerFactory {
    name: Arc<str>,
    retractable: bool,
    make: Arc<MakeFn>,
    neutral: Arc<NeutralFn>,
}

impl ReducerFactory {
    /// Builds a factory for an accumulator type.
    pub fn of<A: Accumulator>(name: &str) -> Self {
        Self {
            name: name.into(),
            retractable: A::RETRACTABLE,
            make: Arc::new(|input| Ok(Box::new(A::from_row(input)?) as Box<dyn AccumulatorState>)),
            neutral: Arc::new(|| A::neutral().map(|a| Box::new(a) as Box<dyn AccumulatorState>)),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_retractable(&self) -> bool {
        self.retractable
    }

    pub fn make(&self, input: &ReducerInput<'_>) -> DataResult<Box<dyn AccumulatorState>> {
        (self.make)(input)
    }

    pub fn neutral(&self) -> Option<Box<dyn AccumulatorState>> {
        (self.neutral)()
    }
}

impl fmt::Debug for ReducerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReducerFactory")
            .field("name", &self.name)
            .field("retractable", &self.retractable)
            .finish()
    }
}
