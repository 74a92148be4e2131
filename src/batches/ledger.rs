//! Batch ledger — capacity accounting and batch-id validation for imports.
//!
//! Only the default batch may be topped up by later imports. Every other
//! batch is sized once, by the import session that created it. Task rows
//! and the count they add are always written together, so a task is never
//! visible before its batch can account for its closure.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::batches::model::Batch;
use crate::error::BatchError;
use crate::store::Database;
use crate::tasks::model::Task;

/// Owns `tasks_count` / `tasks_processed` accounting.
#[derive(Clone)]
pub struct BatchLedger {
    db: Arc<dyn Database>,
}

impl BatchLedger {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Create `batch_id` with `additional_count` tasks, or top up the
    /// default batch.
    pub async fn create_or_extend(
        &self,
        batch_id: &str,
        additional_count: u64,
        task_type: &str,
        default_batch_id: &str,
    ) -> Result<Batch, BatchError> {
        let batch = Batch::new(batch_id, task_type, additional_count);
        if self.db.insert_batch_if_absent(&batch).await? {
            info!(batch_id = %batch_id, task_type = %task_type, count = additional_count, "Batch created");
            return Ok(batch);
        }

        if batch_id != default_batch_id {
            warn!(batch_id = %batch_id, "Refusing to extend non-default batch");
            return Err(BatchError::AlreadyExists {
                batch_id: batch_id.to_string(),
            });
        }

        self.extend(batch_id, additional_count, task_type).await
    }

    /// Add capacity to the default batch, whose stored type must match.
    async fn extend(
        &self,
        batch_id: &str,
        additional_count: u64,
        task_type: &str,
    ) -> Result<Batch, BatchError> {
        if !self
            .db
            .increment_batch_count(batch_id, task_type, additional_count)
            .await?
        {
            return Err(self.type_mismatch(batch_id, task_type).await);
        }

        let batch = self.get(batch_id).await?;
        info!(batch_id = %batch_id, added = additional_count, total = batch.tasks_count, "Batch extended");
        Ok(batch)
    }

    /// Insert `tasks` into an existing batch and add them to its count in
    /// the same write. Nothing is written if the batch is missing or holds
    /// another type.
    pub(crate) async fn append_tasks(
        &self,
        batch_id: &str,
        task_type: &str,
        tasks: &[Task],
    ) -> Result<Batch, BatchError> {
        if !self
            .db
            .insert_tasks_counted(batch_id, task_type, tasks)
            .await?
        {
            return Err(self.type_mismatch(batch_id, task_type).await);
        }

        let batch = self.get(batch_id).await?;
        debug!(batch_id = %batch_id, added = tasks.len(), total = batch.tasks_count, "Tasks added to batch");
        Ok(batch)
    }

    /// Explain a refused count update: the batch is gone or typed otherwise.
    async fn type_mismatch(&self, batch_id: &str, task_type: &str) -> BatchError {
        let stored = match self.get(batch_id).await {
            Ok(stored) => stored,
            Err(e) => return e,
        };
        warn!(
            batch_id = %batch_id,
            stored = %stored.task_type,
            requested = %task_type,
            "Batch type mismatch"
        );
        BatchError::TypeMismatch {
            batch_id: batch_id.to_string(),
            stored: stored.task_type,
            requested: task_type.to_string(),
        }
    }

    /// Check that `batch_id` is a valid import target.
    ///
    /// Fresh ids and the default batch pass. Any other existing id fails.
    pub async fn validate_exists(
        &self,
        batch_id: &str,
        default_batch_id: &str,
    ) -> Result<String, BatchError> {
        if batch_id == default_batch_id {
            return Ok(batch_id.to_string());
        }
        match self.db.get_batch(batch_id).await? {
            None => Ok(batch_id.to_string()),
            Some(_) => Err(BatchError::AlreadyExists {
                batch_id: batch_id.to_string(),
            }),
        }
    }

    /// Count one closed task against its batch.
    ///
    /// `TaskAllocator::complete` does this inside its own completion write;
    /// this entry point is for closures recorded outside the allocator.
    pub async fn record_completion(&self, batch_id: &str) -> Result<Batch, BatchError> {
        if !self.db.increment_batch_processed(batch_id).await? {
            return Err(self.completion_refused(batch_id).await);
        }
        self.get(batch_id).await
    }

    /// Explain a refused `tasks_processed` increment.
    pub(crate) async fn completion_refused(&self, batch_id: &str) -> BatchError {
        match self.get(batch_id).await {
            Ok(batch) => {
                warn!(batch_id = %batch_id, processed = batch.tasks_processed, count = batch.tasks_count, "Batch refused completion");
                BatchError::CompletionRefused {
                    batch_id: batch.id,
                    processed: batch.tasks_processed,
                    count: batch.tasks_count,
                }
            }
            Err(e) => e,
        }
    }

    pub async fn get(&self, batch_id: &str) -> Result<Batch, BatchError> {
        self.db
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| BatchError::NotFound {
                batch_id: batch_id.to_string(),
            })
    }

    pub async fn list(&self, task_type: &str) -> Result<Vec<Batch>, BatchError> {
        Ok(self.db.list_batches(task_type).await?)
    }
}
