//! Schema definitions.
//!
//! Schemas may be declared as explicit field lists ([`SchemaBuilder`]), built
//! from a dictionary of column definitions ([`Schema::from_definitions`]) or
//! inferred from sample CSV input ([`infer`]).

mod column;
mod definition;
pub mod infer;

pub use column::ColumnDefinition;
pub use definition::{Schema, SchemaBuilder};
