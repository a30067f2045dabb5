//! Row structure for Eddy.
//!
//! A `Row` is an immutable tuple of values. Rows never change in place; an
//! update is expressed as the retraction of the old row and the insertion of
//! the new one under the same key.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;

/// An immutable row of values.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Row(Arc<[Value]>);

impl Row {
    /// Creates a row from values.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values.into())
    }

    /// Creates a row with no columns.
    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }

    /// Returns a reference to the values.
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Gets a value at the given column index.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Gets a value, returning `Null` for missing columns.
    #[inline]
    pub fn get_or_null(&self, index: usize) -> Value {
        self.0.get(index).cloned().unwrap_or(Value::Null)
    }

    /// Returns the number of values in this row.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if this row has no values.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new row with the selected columns.
    pub fn project(&self, columns: &[usize]) -> Row {
        Row::new(columns.iter().map(|&c| self.get_or_null(c)).collect())
    }

    /// Returns the selected column values.
    pub fn extract(&self, columns: &[usize]) -> Vec<Value> {
        columns.iter().map(|&c| self.get_or_null(c)).collect()
    }

    /// Returns the concatenation of two rows.
    pub fn concat(&self, other: &Row) -> Row {
        let mut values = Vec::with_capacity(self.len() + other.len());
        values.extend(self.0.iter().cloned());
        values.extend(other.0.iter().cloned());
        Row::new(values)
    }

    /// Returns a new row with extra values appended.
    pub fn with_appended(&self, extra: impl IntoIterator<Item = Value>) -> Row {
        let mut values = self.0.to_vec();
        values.extend(extra);
        Row::new(values)
    }

    /// Returns a row of `len` nulls.
    pub fn nulls(len: usize) -> Row {
        Row::new(vec![Value::Null; len])
    }

    /// Returns true if any cell holds the error marker.
    pub fn contains_error(&self) -> bool {
        self.0.iter().any(Value::is_error)
    }
}

impl Deref for Row {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.0
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Row::new(values)
    }
}

impl FromIterator<Value> for Row {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Row(iter.into_iter().collect())
    }
}

/// Builds a row from a list of expressions convertible into values.
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        $crate::Row::new(vec![$($crate::Value::from($value)),*])
    };
}
