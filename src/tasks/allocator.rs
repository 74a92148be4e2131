//! Task allocator — hands tasks to workers and records skips and answers.
//!
//! There is no in-process lock. Every mutation reads the task, decides, and
//! writes back with a compare-and-set on the row version; a lost race
//! re-reads and decides again. A completion writes the task, its answer and
//! (when it flips `closed`) the batch count in one storage write, so each
//! closure is counted once and never without its answer.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::batches::BatchLedger;
use crate::error::{BatchError, DatabaseError, TaskError};
use crate::store::{CompletionWrite, Database};
use crate::task_types::{TaskTypeHandle, TaskTypeRegistry, TaskTypeSummary};
use crate::tasks::model::{Answer, Payload, Task, WorkerRelation};
use crate::workers::Worker;

/// Default optimistic retries for one mutation.
const DEFAULT_MAX_ATTEMPTS: u32 = 16;

/// Assignment state machine over the storage gateway.
pub struct TaskAllocator {
    db: Arc<dyn Database>,
    registry: Arc<TaskTypeRegistry>,
    ledger: BatchLedger,
    max_attempts: u32,
}

impl TaskAllocator {
    pub fn new(db: Arc<dyn Database>, registry: Arc<TaskTypeRegistry>) -> Self {
        let ledger = BatchLedger::new(db.clone());
        Self {
            db,
            registry,
            ledger,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Builder: cap optimistic retries per mutation.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn ledger(&self) -> &BatchLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<TaskTypeRegistry> {
        &self.registry
    }

    fn resolve_for(&self, worker: &Worker, type_name: &str) -> Result<TaskTypeHandle, TaskError> {
        let handle = self
            .registry
            .resolve(type_name)
            .ok_or_else(|| TaskError::TypeNotFound {
                type_name: type_name.to_string(),
            })?;
        if !handle.is_eligible(worker) {
            return Err(TaskError::NotEligible {
                worker: worker.id.clone(),
                type_name: type_name.to_string(),
            });
        }
        Ok(handle)
    }

    async fn load(&self, task_id: &str) -> Result<Task, TaskError> {
        self.db
            .get_task(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Pick an open task of `type_name` the worker has not seen yet.
    ///
    /// `Ok(None)` means nothing is available right now.
    pub async fn next(&self, worker: &Worker, type_name: &str) -> Result<Option<Task>, TaskError> {
        let handle = self.resolve_for(worker, type_name)?;
        let task = self
            .db
            .find_candidate_task(handle.type_name(), &worker.id)
            .await?;

        match &task {
            Some(t) => debug!(task_id = %t.id, worker = %worker.id, "Task assigned"),
            None => debug!(task_type = %type_name, worker = %worker.id, "No task available"),
        }
        Ok(task)
    }

    /// Record that the worker declined a task. Idempotent.
    ///
    /// Scoped to the task's stored type; the worker must be eligible for it.
    pub async fn skip(&self, worker: &Worker, task_id: &str) -> Result<(), TaskError> {
        for attempt in 1..=self.max_attempts {
            let mut task = self.load(task_id).await?;
            self.resolve_for(worker, &task.task_type)?;

            match task.relation_of(&worker.id) {
                WorkerRelation::Processed => {
                    warn!(task_id = %task_id, worker = %worker.id, "Skip rejected: already completed");
                    return Err(TaskError::AlreadyCompleted {
                        worker: worker.id.clone(),
                        task_id: task_id.to_string(),
                    });
                }
                WorkerRelation::Skipped => return Ok(()),
                WorkerRelation::Unseen => {}
            }

            let expected = task.version;
            task.users_skipped.insert(worker.id.clone());
            if self.db.update_task_if_version(&task, expected).await?.is_some() {
                debug!(task_id = %task_id, worker = %worker.id, "Task skipped");
                return Ok(());
            }
            warn!(task_id = %task_id, attempt, "Skip lost a race, retrying");
        }

        Err(TaskError::Contention {
            task_id: task_id.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Record the worker's answer and close the task once enough distinct
    /// workers have answered.
    ///
    /// Duplicate submissions and submissions to closed tasks are rejected,
    /// so retrying a call whose outcome is unknown is safe.
    pub async fn complete(
        &self,
        worker: &Worker,
        task_id: &str,
        result: Payload,
    ) -> Result<Answer, TaskError> {
        for attempt in 1..=self.max_attempts {
            let current = self.load(task_id).await?;
            let handle = self.resolve_for(worker, &current.task_type)?;

            match current.relation_of(&worker.id) {
                WorkerRelation::Processed => {
                    warn!(task_id = %task_id, worker = %worker.id, "Duplicate answer rejected");
                    return Err(TaskError::AlreadyCompleted {
                        worker: worker.id.clone(),
                        task_id: task_id.to_string(),
                    });
                }
                WorkerRelation::Skipped => {
                    return Err(TaskError::AlreadySkipped {
                        worker: worker.id.clone(),
                        task_id: task_id.to_string(),
                    });
                }
                WorkerRelation::Unseen => {}
            }
            if current.closed {
                warn!(task_id = %task_id, worker = %worker.id, "Answer to closed task rejected");
                return Err(TaskError::Closed {
                    task_id: task_id.to_string(),
                });
            }
            handle
                .validate_answer(&result)
                .map_err(|reason| TaskError::InvalidAnswer {
                    task_id: task_id.to_string(),
                    reason,
                })?;

            let mut updated = current.clone();
            updated.users_processed.insert(worker.id.clone());
            updated.closed = updated.redundancy_met();
            let answer = Answer::new(&updated, worker.id.clone(), result.clone());

            let written = self
                .db
                .complete_task_if_version(&updated, current.version, &answer)
                .await
                .map_err(|e| match e {
                    DatabaseError::Constraint(_) => TaskError::AlreadyCompleted {
                        worker: worker.id.clone(),
                        task_id: task_id.to_string(),
                    },
                    other => TaskError::Database(other),
                })?;

            match written {
                CompletionWrite::Committed { .. } => {
                    if updated.closed {
                        info!(task_id = %task_id, answers = updated.users_processed.len(), "Task closed");
                    }
                    debug!(task_id = %task_id, worker = %worker.id, "Answer recorded");
                    return Ok(answer);
                }
                CompletionWrite::VersionConflict => {
                    warn!(task_id = %task_id, attempt, "Complete lost a race, retrying");
                }
                CompletionWrite::BatchRefused => {
                    let batch_id = updated.batch.as_deref().unwrap_or_default();
                    return Err(self.ledger.completion_refused(batch_id).await.into());
                }
            }
        }

        Err(TaskError::Contention {
            task_id: task_id.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Persist new open tasks of `handle`'s type in one write.
    ///
    /// With a batch, the batch must already exist with the same type; its
    /// `tasks_count` grows by the number of tasks in that same write.
    pub async fn create_tasks(
        &self,
        handle: &TaskTypeHandle,
        batch_id: Option<&str>,
        records: Vec<Payload>,
    ) -> Result<Vec<Task>, BatchError> {
        let tasks: Vec<Task> = records
            .into_iter()
            .map(|data| {
                Task::new(
                    handle.type_name(),
                    batch_id.map(String::from),
                    data,
                    handle.redundancy(),
                )
            })
            .collect();
        match batch_id {
            Some(batch_id) => {
                self.ledger
                    .append_tasks(batch_id, handle.type_name(), &tasks)
                    .await?;
            }
            None => self.db.insert_tasks(&tasks).await?,
        }
        Ok(tasks)
    }

    /// Listing entry for one type.
    pub async fn summary(&self, type_name: &str) -> Result<TaskTypeSummary, TaskError> {
        let handle = self
            .registry
            .resolve(type_name)
            .ok_or_else(|| TaskError::TypeNotFound {
                type_name: type_name.to_string(),
            })?;
        let tasks = self.db.count_tasks(handle.type_name()).await?;
        Ok(handle.summary(tasks))
    }

    /// Listing entries for every type the worker may work on.
    pub async fn summaries_for(&self, worker: &Worker) -> Result<Vec<TaskTypeSummary>, TaskError> {
        let mut summaries = Vec::new();
        for type_name in self.registry.eligible_types(worker) {
            summaries.push(self.summary(&type_name).await?);
        }
        Ok(summaries)
    }
}
