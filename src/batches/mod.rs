//! Batches — accounting groups of tasks.

pub mod ledger;
pub mod model;

pub use ledger::BatchLedger;
pub use model::Batch;
