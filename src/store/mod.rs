//! Persistence layer — libSQL-backed storage for batches, tasks and answers.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CompletionWrite, Database, WorkerAnswerCount};
