//! Batch data model.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Accounting group of tasks sharing a capacity counter and a task type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub task_type: String,
    /// Total capacity. Only ever grows.
    pub tasks_count: u64,
    /// Closed tasks. Only ever grows, never past `tasks_count`.
    pub tasks_processed: u64,
}

impl Batch {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, tasks_count: u64) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            tasks_count,
            tasks_processed: 0,
        }
    }

    /// Every task in the batch is closed.
    pub fn is_exhausted(&self) -> bool {
        self.tasks_processed >= self.tasks_count
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Batch [{}] ({}/{})",
            self.id, self.tasks_processed, self.tasks_count
        )
    }
}
