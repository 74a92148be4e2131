//! Task and answer data model.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Opaque mapping carried by tasks and answers.
pub type Payload = Map<String, Value>;

/// Relation between one worker and one task. Transitions are monotone:
/// `Unseen -> Skipped` or `Unseen -> Processed`, never further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRelation {
    Unseen,
    Skipped,
    Processed,
}

/// A unit of crowd-work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    /// Owning batch, lookup only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<String>,
    pub task_data: Payload,
    /// Terminal once true.
    pub closed: bool,
    /// Distinct completions required before the task closes.
    pub users_count: u32,
    pub users_processed: BTreeSet<String>,
    pub users_skipped: BTreeSet<String>,
    /// Storage revision, bumped on every successful conditional update.
    #[serde(skip)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a fresh open task.
    pub fn new(
        task_type: impl Into<String>,
        batch: Option<String>,
        task_data: Payload,
        users_count: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            batch,
            task_data,
            closed: false,
            users_count,
            users_processed: BTreeSet::new(),
            users_skipped: BTreeSet::new(),
            version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn relation_of(&self, worker_id: &str) -> WorkerRelation {
        if self.users_processed.contains(worker_id) {
            WorkerRelation::Processed
        } else if self.users_skipped.contains(worker_id) {
            WorkerRelation::Skipped
        } else {
            WorkerRelation::Unseen
        }
    }

    pub fn redundancy_met(&self) -> bool {
        self.users_processed.len() >= self.users_count as usize
    }

    /// Lightweight form handed to callers.
    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            closed: self.closed,
            data: self.task_data.clone(),
        }
    }
}

/// Safe serialized form of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    pub closed: bool,
    pub data: Payload,
}

/// One worker's submitted result for one task. Unique per `(created_by, task_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub id: Uuid,
    pub task_id: String,
    pub task_type: String,
    pub created_by: String,
    pub result: Payload,
    pub created_at: DateTime<Utc>,
}

impl Answer {
    pub fn new(task: &Task, created_by: impl Into<String>, result: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            created_by: created_by.into(),
            result,
            created_at: Utc::now(),
        }
    }
}
