//! Autoscaled Pool Module
//!
//! Runs user-supplied async tasks in parallel, continuously resizing the
//! permitted concurrency from memory and CPU load signals.

pub mod config;
mod history;
mod pool;

pub use config::{
    AutoscaledPoolConfig, AutoscaledPoolOptions, PredicateFn, RunTaskFn, TaskFuture,
};
pub use pool::AutoscaledPool;
