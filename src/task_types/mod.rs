//! Task type registry — named task families with their schemas, templates
//! and redundancy policy.

pub mod registry;
pub mod schema;

pub use registry::{TaskType, TaskTypeHandle, TaskTypeRegistry, TaskTypeSummary};
pub use schema::{Contract, Schema};
