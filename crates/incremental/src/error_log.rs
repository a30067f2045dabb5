//! Per-row error reporting.
//!
//! Row-level failures never abort a batch. Each one is recorded here, next to
//! the `Value::Error` cell (or dropped row) it left behind.

use eddy_core::{DataError, Key, Timestamp};
use serde::{Deserialize, Serialize};

/// One recorded row-level failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub time: Timestamp,
    pub operator: String,
    pub key: Option<Key>,
    pub message: String,
}

/// An append-only log of row-level failures.
#[derive(Clone, Debug, Default)]
pub struct ErrorLog {
    entries: Vec<ErrorEntry>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ErrorEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = ErrorEntry>) {
        self.entries.extend(entries);
    }

    #[inline]
    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Takes every entry recorded so far.
    pub fn drain(&mut self) -> Vec<ErrorEntry> {
        std::mem::take(&mut self.entries)
    }
}

/// Context handed to an operator for one batch.
#[derive(Debug)]
pub struct StepContext {
    time: Timestamp,
    operator: String,
    errors: Vec<ErrorEntry>,
}

impl StepContext {
    pub fn new(time: Timestamp, operator: impl Into<String>) -> Self {
        Self {
            time,
            operator: operator.into(),
            errors: Vec::new(),
        }
    }

    /// Processing time of the current batch.
    #[inline]
    pub fn time(&self) -> Timestamp {
        self.time
    }

    #[inline]
    pub fn operator(&self) -> &str {
        &self.operator
    }

    /// Records a row-level failure.
    pub fn report(&mut self, key: Option<Key>, error: &DataError) {
        tracing::debug!(operator = %self.operator, time = %self.time, error = %error, "row error");
        self.errors.push(ErrorEntry {
            time: self.time,
            operator: self.operator.clone(),
            key,
            message: error.to_string(),
        });
    }

    /// Takes over failures recorded by a nested dataflow, stamped with the
    /// current time and operator.
    pub fn absorb(&mut self, entries: impl IntoIterator<Item = ErrorEntry>) {
        for entry in entries {
            self.errors.push(ErrorEntry {
                time: self.time,
                operator: format!("{}/{}", self.operator, entry.operator),
                ..entry
            });
        }
    }

    pub fn into_errors(self) -> Vec<ErrorEntry> {
        self.errors
    }
}
