//! Data type definitions for Eddy.
//!
//! This module defines the column types a schema can declare.

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Supported column types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean type (true/false)
    Boolean,
    /// 64-bit signed integer
    Int,
    /// 64-bit floating point number
    Float,
    /// UTF-8 string
    String,
    /// Date and time stored as Unix timestamp (milliseconds)
    DateTime,
    /// Signed duration in milliseconds
    Duration,
    /// Reference to a row key
    Pointer,
    /// Tuple of values
    Tuple,
    /// Any value; no coercion is applied
    Any,
}

impl DataType {
    /// Returns whether this type is nullable by default.
    pub fn is_nullable_by_default(&self) -> bool {
        matches!(self, DataType::Any | DataType::Tuple)
    }

    /// Returns whether values of this type can be used as event times.
    pub fn is_temporal(&self) -> bool {
        matches!(self, DataType::Int | DataType::DateTime | DataType::Duration)
    }

    /// Returns true if `value` is acceptable for a column of this type.
    ///
    /// `Null` and `Error` are accepted everywhere; nullability is checked
    /// by the schema.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (_, Value::Error) | (DataType::Any, _) => true,
            (DataType::Boolean, Value::Boolean(_))
            | (DataType::Int, Value::Int(_))
            | (DataType::Float, Value::Float(_))
            | (DataType::Float, Value::Int(_))
            | (DataType::String, Value::String(_))
            | (DataType::DateTime, Value::DateTime(_))
            | (DataType::Duration, Value::Duration(_))
            | (DataType::Pointer, Value::Pointer(_))
            | (DataType::Tuple, Value::Tuple(_)) => true,
            _ => false,
        }
    }

    /// Coerces a value into this type where a lossless conversion exists.
    pub fn coerce(&self, value: Value) -> Option<Value> {
        match (self, value) {
            (DataType::Float, Value::Int(v)) => Some(Value::Float(v as f64)),
            (DataType::DateTime, Value::Int(v)) => Some(Value::DateTime(v)),
            (DataType::Duration, Value::Int(v)) => Some(Value::Duration(v)),
            (dtype, value) if dtype.accepts(&value) => Some(value),
            _ => None,
        }
    }

    /// Parses a textual cell into a value of this type.
    ///
    /// Empty cells parse to `Null`.
    pub fn parse_value(&self, text: &str) -> Option<Value> {
        let text = text.trim();
        if text.is_empty() {
            return Some(Value::Null);
        }
        match self {
            DataType::Boolean => match text.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Some(Value::Boolean(true)),
                "false" | "f" | "0" | "no" => Some(Value::Boolean(false)),
                _ => None,
            },
            DataType::Int => text.parse::<i64>().ok().map(Value::Int),
            DataType::Float => text.parse::<f64>().ok().map(Value::Float),
            DataType::DateTime => text.parse::<i64>().ok().map(Value::DateTime),
            DataType::Duration => text.parse::<i64>().ok().map(Value::Duration),
            DataType::String | DataType::Any => Some(Value::from(text)),
            DataType::Pointer | DataType::Tuple => None,
        }
    }
}
