//! Eddy Incremental - the incremental dataflow engine.
//!
//! Tables are keyed collections that change over time. A change is a keyed
//! row with a diff of +1 (insertion) or -1 (retraction), and changes are
//! grouped into batches closed at a logical [`Timestamp`](eddy_core::Timestamp).
//! A [`Dataflow`] describes how output tables derive from input tables; an
//! [`Executor`] runs it batch by batch, turning the input changes of each batch
//! into the output changes of the same batch. Outputs of a batch are visible
//! all at once or not at all.
//!
//! # Operators
//!
//! - `select`, `filter`, `fill_error`, `reindex`, `flatten`: row-local
//! - `groupby_reduce`, `reduce`: aggregation with built-in and custom reducers
//! - `join`, `interval_join`, `window_join`, `asof_join`: joins
//! - `windowby`, `buffer`, `forget`: windows and temporal behavior
//! - `iterate`: fixed points over changing data
//! - `concat`, `deduplicate`: unions and per-instance deduplication
//!
//! # Example
//!
//! ```
//! use eddy_core::{row, Key, Timestamp};
//! use eddy_incremental::operators::Reducer;
//! use eddy_incremental::{Dataflow, Executor, Update};
//! use hashbrown::HashMap;
//!
//! let mut df = Dataflow::new();
//! let payments = df.input("payments", 2).unwrap();
//! let totals = df
//!     .groupby_reduce(payments, &[0], vec![Reducer::IntSum.on(&[1])])
//!     .unwrap();
//! df.output("totals", totals).unwrap();
//!
//! let mut exec = Executor::new(df);
//! let mut inputs = HashMap::new();
//! inputs.insert(
//!     "payments".to_string(),
//!     vec![
//!         Update::insert_row(Key(1), row!["alice", 5i64]),
//!         Update::insert_row(Key(2), row!["alice", 7i64]),
//!     ],
//! );
//! let output = exec.run_batch(Timestamp(1), inputs).unwrap();
//! assert_eq!(output.get("totals")[0].row(), &row!["alice", 12i64]);
//! ```

pub mod collection;
pub mod dataflow;
pub mod delta;
pub mod error_log;
pub mod executor;
pub mod log;
pub mod operators;

pub use collection::{KeyedTable, VersionedTable};
pub use dataflow::{ColumnId, Dataflow, DataflowGraph, NodeId, Operator, TableRef};
pub use delta::{consolidate, Change, ChangeBatch, Delta, DeltaBatch, Update};
pub use error_log::{ErrorEntry, ErrorLog, StepContext};
pub use executor::{BatchOutput, Executor};
pub use log::{ClosedBatches, EventLog};
