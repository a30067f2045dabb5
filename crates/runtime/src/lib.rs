//! Eddy Runtime - drives Eddy dataflows from sources to sinks.
//!
//! This crate connects the incremental engine to the outside world:
//!
//! - `Source` / `Sink`: connector interfaces, with in-memory implementations
//! - `Runtime`: the polling loop closing times and running executor batches
//! - `SubscriptionManager` / `ChangeSet`: per-batch callbacks on outputs
//! - `CheckpointStore`: batch log and progress metadata for recovery
//! - `AsyncTransformer`: async per-row calls with timeouts, retries and
//!   instance consistency
//! - `AsyncSource`: feeds a transformer's results and failures into inputs
//! - `Config` / `logging`: configuration and log setup
//!
//! # Example
//!
//! ```rust
//! use eddy_core::schema::SchemaBuilder;
//! use eddy_core::{row, DataType, Timestamp};
//! use eddy_incremental::operators::Reducer;
//! use eddy_incremental::Dataflow;
//! use eddy_runtime::{CollectingSink, Config, Runtime, StaticSource};
//!
//! let schema = SchemaBuilder::new("clicks")
//!     .column("page", DataType::String)
//!     .build()
//!     .unwrap();
//!
//! let mut df = Dataflow::new();
//! let clicks = df.input_schema(&schema).unwrap();
//! let counts = df.groupby_reduce(clicks, &[0], vec![Reducer::Count.on(&[])]).unwrap();
//! df.output("counts", counts).unwrap();
//!
//! let source = StaticSource::from_rows(
//!     schema,
//!     vec![
//!         (row!["home"], Timestamp(1)),
//!         (row!["home"], Timestamp(2)),
//!         (row!["about"], Timestamp(2)),
//!     ],
//! )
//! .unwrap();
//! let sink = CollectingSink::new();
//!
//! let mut runtime = Runtime::new(df, Config::default()).unwrap();
//! runtime.add_source("clicks", source).unwrap();
//! runtime.add_sink("counts", sink.clone()).unwrap();
//! runtime.run().unwrap();
//!
//! let counts: Vec<_> = sink.collected().snapshot().into_values().collect();
//! assert_eq!(counts.len(), 2);
//! assert!(counts.contains(&row!["home", 2i64]));
//! ```

mod async_source;
mod async_transform;
mod change_set;
mod config;
mod connector;
mod error;
mod persist;
mod runtime;
mod subscription;

pub mod logging;

pub use async_source::{AsyncSource, FailedSource};
pub use async_transform::{
    AsyncOptions, AsyncTransformer, Consistency, RetryStrategy, TransformOutput,
};
pub use change_set::ChangeSet;
pub use config::{AsyncConfig, Config, PersistenceConfig};
pub use connector::{Collected, CollectingSink, Sink, Source, SourceEvent, StaticSource};
pub use error::{Result, RuntimeError};
pub use persist::{CheckpointMetadata, CheckpointStore, PersistedBatch};
pub use runtime::{Runtime, RuntimeStats, StepReport};
pub use subscription::{
    ChangeCallback, EndCallback, Subscription, SubscriptionId, SubscriptionManager,
};
