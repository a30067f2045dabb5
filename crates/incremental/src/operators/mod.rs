//! Incremental operators.
//!
//! Every operator consumes and produces keyed update streams. Each module
//! also extends [`Dataflow`](crate::dataflow::Dataflow) with the builder
//! methods for its operators.

mod expr;
mod filter;
mod iterate;
pub mod join;
mod map;
mod misc;
pub mod reduce;
pub mod temporal;
pub mod window;

pub use expr::{checked_div, Expr};
pub use filter::{filter_incremental, Filter, Predicate};
pub use iterate::{Iterate, IterateBody, IterateOptions};
pub use join::{AsofDirection, AsofJoinType, AsofOptions, JoinType};
pub use map::{map_incremental, FillError, Flatten, Reindex, Select};
pub use misc::{Acceptor, Concat, Deduplicate};
pub use reduce::{Accumulator, GroupReduce, Reducer, ReducerInput, ReducerSpec};
pub use temporal::{Buffer, Forget, TemporalBehavior, TimeTracker};
pub use window::{Window, WindowBy};
