//! Eddy Core - values, keys, rows and schemas for the Eddy dataflow engine.
//!
//! This crate provides the foundational types shared by every other crate:
//!
//! - `DataType`: column types (Boolean, Int, Float, String, DateTime, Duration, Pointer, Tuple, Any)
//! - `Value`: runtime cell values, including the `Error` marker for failed row computations
//! - `Key`: deterministic 128-bit row identifiers
//! - `Row`: immutable tuples of values
//! - `Timestamp`: processing time of a batch
//! - `schema`: schema definitions and CSV schema inference
//! - `Error` / `DataError`: structural and row-level errors
//!
//! # Example
//!
//! ```rust
//! use eddy_core::schema::SchemaBuilder;
//! use eddy_core::{row, DataType, KeyGenerator, Value};
//!
//! let schema = SchemaBuilder::new("users")
//!     .column("id", DataType::Int)
//!     .column("name", DataType::String)
//!     .primary_key(&["id"])
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let row = row![1i64, "Alice"];
//! let generator = KeyGenerator::new("users");
//! let key = schema.key_for(&row, &generator);
//!
//! assert_eq!(key, schema.key_for(&row![1i64, "Alicia"], &generator));
//! assert_eq!(row.get(1), Some(&Value::from("Alice")));
//! ```

mod error;
mod key;
mod row;
mod time;
mod types;
mod value;

pub mod schema;

pub use error::{DataError, DataResult, Error, Result};
pub use key::{Key, KeyGenerator};
pub use row::Row;
pub use time::Timestamp;
pub use types::DataType;
pub use value::Value;
