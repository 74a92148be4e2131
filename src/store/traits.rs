//! Storage gateway — the single async interface for batch, task and answer
//! persistence.
//!
//! Every mutating method is one atomic conditional write: it either applies
//! in full or reports that its guard did not hold. Callers layer their retry
//! policy on top; backends never retry on their own.

use async_trait::async_trait;

use crate::batches::model::Batch;
use crate::error::DatabaseError;
use crate::tasks::model::{Answer, Task};

/// Answers submitted by one worker for one task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAnswerCount {
    pub worker: String,
    pub answers: u64,
}

/// Result of [`Database::complete_task_if_version`]. Anything but
/// `Committed` leaves storage untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionWrite {
    /// Task, answer and batch accounting were written together.
    Committed { version: i64 },
    /// The stored task version moved on.
    VersionConflict,
    /// The task closed but its batch refused the completion (missing, or
    /// already fully processed).
    BatchRefused,
}

/// Backend-agnostic storage gateway.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Batches ─────────────────────────────────────────────────────

    /// Insert `batch` unless a batch with the same id exists.
    /// Returns `true` if the row was created.
    async fn insert_batch_if_absent(&self, batch: &Batch) -> Result<bool, DatabaseError>;

    /// Get a batch by id.
    async fn get_batch(&self, id: &str) -> Result<Option<Batch>, DatabaseError>;

    /// Add `by` to `tasks_count`, only if the stored `task_type` matches.
    /// Returns `false` when the guard failed or the batch is missing.
    async fn increment_batch_count(
        &self,
        id: &str,
        task_type: &str,
        by: u64,
    ) -> Result<bool, DatabaseError>;

    /// Add one to `tasks_processed`, only while it is below `tasks_count`.
    /// Returns `false` when the guard failed or the batch is missing.
    async fn increment_batch_processed(&self, id: &str) -> Result<bool, DatabaseError>;

    /// List batches bound to a task type, ordered by id.
    async fn list_batches(&self, task_type: &str) -> Result<Vec<Batch>, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert all tasks in one statement: either every row lands or none does.
    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), DatabaseError>;

    /// Insert `tasks` and add their number to `tasks_count` of `batch_id`,
    /// as one unit. Returns `false`, writing nothing, when the batch is
    /// missing or bound to another type.
    async fn insert_tasks_counted(
        &self,
        batch_id: &str,
        task_type: &str,
        tasks: &[Task],
    ) -> Result<bool, DatabaseError>;

    /// Get a task by id, with its current storage version.
    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError>;

    /// Find one open task of `task_type` that `worker_id` has neither
    /// processed nor skipped.
    async fn find_candidate_task(
        &self,
        task_type: &str,
        worker_id: &str,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Overwrite the mutable task fields (`closed`, `users_processed`,
    /// `users_skipped`) only if the stored version equals `expected_version`.
    /// Returns the new version, or `None` on a version conflict.
    async fn update_task_if_version(
        &self,
        task: &Task,
        expected_version: i64,
    ) -> Result<Option<i64>, DatabaseError>;

    /// Record a completion as one unit: overwrite the task's mutable fields
    /// if the stored version equals `expected_version`, insert `answer`, and
    /// when `task.closed` is set and the task has a batch, add one to that
    /// batch's `tasks_processed` (guarded by `tasks_processed < tasks_count`).
    ///
    /// A duplicate answer fails with [`DatabaseError::Constraint`]. Any
    /// failure rolls back every step.
    async fn complete_task_if_version(
        &self,
        task: &Task,
        expected_version: i64,
        answer: &Answer,
    ) -> Result<CompletionWrite, DatabaseError>;

    /// Count all tasks of a type.
    async fn count_tasks(&self, task_type: &str) -> Result<u64, DatabaseError>;

    /// Count open tasks of a type.
    async fn count_open_tasks(&self, task_type: &str) -> Result<u64, DatabaseError>;

    // ── Answers ─────────────────────────────────────────────────────

    /// Get the answer a worker submitted for a task.
    async fn get_answer(
        &self,
        task_id: &str,
        created_by: &str,
    ) -> Result<Option<Answer>, DatabaseError>;

    /// Count answers per worker for a task type, most answers first.
    async fn answer_counts_by_worker(
        &self,
        task_type: &str,
    ) -> Result<Vec<WorkerAnswerCount>, DatabaseError>;
}
