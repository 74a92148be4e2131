//! Task pool — hands crowd-work tasks to workers, enforces per-task
//! redundancy and tracks per-batch progress.

pub mod batches;
pub mod config;
pub mod error;
pub mod import;
pub mod stats;
pub mod store;
pub mod task_types;
pub mod tasks;
pub mod workers;
