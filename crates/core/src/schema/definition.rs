//! Table schemas.

use super::column::ColumnDefinition;
use crate::error::{Error, Result};
use crate::key::{Key, KeyGenerator};
use crate::row::Row;
use crate::types::DataType;
use crate::value::Value;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// A static table schema: ordered columns plus an optional primary key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    name: String,
    columns: Vec<ColumnDefinition>,
}

impl Schema {
    /// Creates a schema from an explicit field list.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDefinition>) -> Result<Self> {
        let name = name.into();
        check_naming_rules(&name)?;
        let mut seen: HashMap<String, ()> = HashMap::new();
        for col in &columns {
            check_naming_rules(&col.name)?;
            if seen.insert(col.name.clone(), ()).is_some() {
                return Err(Error::invalid_schema(format!(
                    "column already exists: {}",
                    col.name
                )));
            }
        }
        Ok(Self { name, columns })
    }

    /// Creates a schema from a dictionary of name to definition.
    ///
    /// The dictionary key overrides the definition's own name.
    pub fn from_definitions<K, I>(name: impl Into<String>, definitions: I) -> Result<Self>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ColumnDefinition)>,
    {
        let columns = definitions
            .into_iter()
            .map(|(k, mut def)| {
                def.name = k.into();
                def
            })
            .collect();
        Self::new(name, columns)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Gets a column index by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Gets a column index by name, failing for unknown columns.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| Error::column_not_found(name))
    }

    /// Returns the indices of the primary-key columns in declaration order.
    pub fn primary_key_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect()
    }

    /// Returns the key for a row.
    ///
    /// With a primary key the key is derived from the primary-key values, so the
    /// same logical record always receives the same key. Without one the next
    /// key of `generator` is used.
    pub fn key_for(&self, row: &Row, generator: &KeyGenerator) -> Key {
        let pk = self.primary_key_columns();
        if pk.is_empty() {
            generator.next_key()
        } else {
            Key::for_values(&row.extract(&pk))
        }
    }

    /// Builds a row from named values, applying defaults and coercion.
    pub fn row_from_map(&self, mut values: HashMap<String, Value>) -> Result<Row> {
        let mut out = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            let value = match values.remove(&col.name) {
                Some(v) => v,
                None => col
                    .fallback()
                    .ok_or_else(|| Error::column_not_found(col.name.clone()))?,
            };
            out.push(self.coerce_cell(col, value)?);
        }
        if let Some(extra) = values.keys().next() {
            return Err(Error::column_not_found(extra.clone()));
        }
        Ok(Row::new(out))
    }

    /// Checks arity, types and nullability, coercing cells where possible.
    pub fn validate_row(&self, row: &Row) -> Result<Row> {
        if row.len() != self.columns.len() {
            return Err(Error::invalid_schema(format!(
                "row has {} values, schema {} has {} columns",
                row.len(),
                self.name,
                self.columns.len()
            )));
        }
        self.columns
            .iter()
            .zip(row.values())
            .map(|(col, v)| self.coerce_cell(col, v.clone()))
            .collect::<Result<Vec<_>>>()
            .map(Row::new)
    }

    /// Parses a textual record, e.g. a CSV line, into a row.
    pub fn parse_record<'a>(&self, fields: impl IntoIterator<Item = &'a str>) -> Result<Row> {
        let mut out = Vec::with_capacity(self.columns.len());
        let mut fields = fields.into_iter();
        for col in &self.columns {
            let text = fields.next().unwrap_or("");
            let value = col.dtype.parse_value(text).ok_or_else(|| Error::TypeMismatch {
                column: col.name.clone(),
                expected: col.dtype,
                got: text.to_string(),
            })?;
            let value = match value {
                Value::Null => col.fallback().unwrap_or(Value::Null),
                v => v,
            };
            out.push(self.coerce_cell(col, value)?);
        }
        Ok(Row::new(out))
    }

    fn coerce_cell(&self, col: &ColumnDefinition, value: Value) -> Result<Value> {
        if value.is_null() && !col.nullable {
            return Err(Error::TypeMismatch {
                column: col.name.clone(),
                expected: col.dtype,
                got: "None".into(),
            });
        }
        let got = value.to_string();
        col.dtype.coerce(value).ok_or(Error::TypeMismatch {
            column: col.name.clone(),
            expected: col.dtype,
            got,
        })
    }
}

/// Builder for schemas declared as explicit field lists.
pub struct SchemaBuilder {
    name: String,
    columns: Vec<ColumnDefinition>,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Adds a column with the type's default nullability.
    pub fn column(mut self, name: impl Into<String>, dtype: DataType) -> Self {
        self.columns.push(ColumnDefinition::new(name, dtype));
        self
    }

    /// Adds a fully specified column.
    pub fn add(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    /// Marks the named columns as the primary key.
    pub fn primary_key(mut self, names: &[&str]) -> Result<Self> {
        for name in names {
            let col = self
                .columns
                .iter_mut()
                .find(|c| c.name == *name)
                .ok_or_else(|| Error::column_not_found(*name))?;
            col.primary_key = true;
        }
        Ok(self)
    }

    /// Marks the named columns as nullable.
    pub fn nullable(mut self, names: &[&str]) -> Self {
        for col in self.columns.iter_mut() {
            if names.contains(&col.name.as_str()) {
                col.nullable = true;
            }
        }
        self
    }

    pub fn build(self) -> Result<Schema> {
        Schema::new(self.name, self.columns)
    }
}

fn check_naming_rules(name: &str) -> Result<()> {
    let mut chars = name.chars();
    match chars.next() {
        None => Err(Error::invalid_schema("name cannot be empty")),
        Some(first) if !first.is_alphabetic() && first != '_' => Err(Error::invalid_schema(
            format!("name must start with a letter or underscore: {name}"),
        )),
        Some(_) if !chars.all(|c| c.is_alphanumeric() || c == '_') => Err(
            Error::invalid_schema(format!("name contains invalid characters: {name}")),
        ),
        Some(_) => Ok(()),
    }
}
