//! Column definitions.

use crate::types::DataType;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// A column definition in a schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub dtype: DataType,
    /// Whether the column allows nulls.
    #[serde(default)]
    pub nullable: bool,
    /// Whether the column participates in the primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Value used when an ingress record omits the column.
    #[serde(default)]
    pub default: Option<Value>,
}

impl ColumnDefinition {
    /// Creates a column definition.
    pub fn new(name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            dtype,
            nullable: dtype.is_nullable_by_default(),
            primary_key: false,
            default: None,
        }
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn primary_key(mut self, primary_key: bool) -> Self {
        self.primary_key = primary_key;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Returns the value for a missing cell, if the column has one.
    ///
    /// Nullable columns fall back to `Null`; non-nullable columns without a
    /// default have no fallback.
    pub fn fallback(&self) -> Option<Value> {
        match &self.default {
            Some(v) => Some(v.clone()),
            None if self.nullable => Some(Value::Null),
            None => None,
        }
    }
}
