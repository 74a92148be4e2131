//! Integration tests for storage failures and imports racing live traffic.
//!
//! `FlakyDb` wraps a real libSQL backend and can fail the next completion
//! write, either before it reaches storage or after it has committed (a
//! timeout the caller cannot tell apart from a failure).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tokio::time::timeout;

use taskpool::batches::Batch;
use taskpool::error::{DatabaseError, ErrorKind, TaskError};
use taskpool::import::{Importer, records_from_values};
use taskpool::store::{CompletionWrite, Database, LibSqlBackend, WorkerAnswerCount};
use taskpool::task_types::{TaskType, TaskTypeRegistry};
use taskpool::tasks::{Answer, Payload, Task, TaskAllocator};
use taskpool::workers::{Group, Worker};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy)]
enum Fault {
    /// Fail without touching storage.
    BeforeWrite,
    /// Let the write commit, then report a failure.
    AfterCommit,
}

struct FlakyDb {
    inner: LibSqlBackend,
    next_fault: Mutex<Option<Fault>>,
}

impl FlakyDb {
    fn arm(&self, fault: Fault) {
        *self.next_fault.lock().unwrap() = Some(fault);
    }

    fn take_fault(&self) -> Option<Fault> {
        self.next_fault.lock().unwrap().take()
    }
}

fn timed_out() -> DatabaseError {
    DatabaseError::Query("timeout".into())
}

#[async_trait]
impl Database for FlakyDb {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn insert_batch_if_absent(&self, batch: &Batch) -> Result<bool, DatabaseError> {
        self.inner.insert_batch_if_absent(batch).await
    }

    async fn get_batch(&self, id: &str) -> Result<Option<Batch>, DatabaseError> {
        self.inner.get_batch(id).await
    }

    async fn increment_batch_count(
        &self,
        id: &str,
        task_type: &str,
        by: u64,
    ) -> Result<bool, DatabaseError> {
        self.inner.increment_batch_count(id, task_type, by).await
    }

    async fn increment_batch_processed(&self, id: &str) -> Result<bool, DatabaseError> {
        self.inner.increment_batch_processed(id).await
    }

    async fn list_batches(&self, task_type: &str) -> Result<Vec<Batch>, DatabaseError> {
        self.inner.list_batches(task_type).await
    }

    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), DatabaseError> {
        self.inner.insert_tasks(tasks).await
    }

    async fn insert_tasks_counted(
        &self,
        batch_id: &str,
        task_type: &str,
        tasks: &[Task],
    ) -> Result<bool, DatabaseError> {
        self.inner.insert_tasks_counted(batch_id, task_type, tasks).await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError> {
        self.inner.get_task(id).await
    }

    async fn find_candidate_task(
        &self,
        task_type: &str,
        worker_id: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        self.inner.find_candidate_task(task_type, worker_id).await
    }

    async fn update_task_if_version(
        &self,
        task: &Task,
        expected_version: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        self.inner.update_task_if_version(task, expected_version).await
    }

    async fn complete_task_if_version(
        &self,
        task: &Task,
        expected_version: i64,
        answer: &Answer,
    ) -> Result<CompletionWrite, DatabaseError> {
        match self.take_fault() {
            Some(Fault::BeforeWrite) => Err(timed_out()),
            Some(Fault::AfterCommit) => {
                self.inner
                    .complete_task_if_version(task, expected_version, answer)
                    .await?;
                Err(timed_out())
            }
            None => {
                self.inner
                    .complete_task_if_version(task, expected_version, answer)
                    .await
            }
        }
    }

    async fn count_tasks(&self, task_type: &str) -> Result<u64, DatabaseError> {
        self.inner.count_tasks(task_type).await
    }

    async fn count_open_tasks(&self, task_type: &str) -> Result<u64, DatabaseError> {
        self.inner.count_open_tasks(task_type).await
    }

    async fn get_answer(
        &self,
        task_id: &str,
        created_by: &str,
    ) -> Result<Option<Answer>, DatabaseError> {
        self.inner.get_answer(task_id, created_by).await
    }

    async fn answer_counts_by_worker(
        &self,
        task_type: &str,
    ) -> Result<Vec<WorkerAnswerCount>, DatabaseError> {
        self.inner.answer_counts_by_worker(task_type).await
    }
}

fn registry(redundancy: u32) -> Arc<TaskTypeRegistry> {
    let mut registry = TaskTypeRegistry::new();
    registry
        .register(TaskType::new("declarations", "base").with_redundancy(redundancy))
        .unwrap();
    Arc::new(registry)
}

fn worker(id: &str) -> Worker {
    Worker::new(id).with_group(Group::new("default", &["declarations"]))
}

async fn flaky_pool() -> (Arc<FlakyDb>, TaskAllocator, Task) {
    let db = Arc::new(FlakyDb {
        inner: LibSqlBackend::new_memory().await.unwrap(),
        next_fault: Mutex::new(None),
    });
    let allocator = TaskAllocator::new(db.clone(), registry(1));
    allocator
        .ledger()
        .create_or_extend("b1", 0, "declarations", "default")
        .await
        .unwrap();
    let handle = allocator.registry().resolve("declarations").unwrap();
    let task = allocator
        .create_tasks(&handle, Some("b1"), vec![Payload::new()])
        .await
        .unwrap()
        .remove(0);
    (db, allocator, task)
}

/// Closed tasks match the batch count and every processed worker answered.
async fn assert_consistent(db: &dyn Database, allocator: &TaskAllocator, task_id: &str) {
    let stored = db.get_task(task_id).await.unwrap().unwrap();
    for w in &stored.users_processed {
        assert!(
            db.get_answer(task_id, w).await.unwrap().is_some(),
            "{w} is processed but has no answer"
        );
    }
    let closed = db.count_tasks("declarations").await.unwrap()
        - db.count_open_tasks("declarations").await.unwrap();
    let batch = allocator.ledger().get("b1").await.unwrap();
    assert_eq!(batch.tasks_processed, closed);
}

#[tokio::test]
async fn failed_completion_leaves_task_untouched_and_retry_succeeds() {
    let (db, allocator, task) = flaky_pool().await;
    db.arm(Fault::BeforeWrite);

    let err = allocator
        .complete(&worker("w1"), &task.id, Payload::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);

    let stored = db.get_task(&task.id).await.unwrap().unwrap();
    assert!(!stored.closed);
    assert!(stored.users_processed.is_empty());
    assert_consistent(db.as_ref(), &allocator, &task.id).await;

    allocator
        .complete(&worker("w1"), &task.id, Payload::new())
        .await
        .unwrap();

    let stored = db.get_task(&task.id).await.unwrap().unwrap();
    assert!(stored.closed);
    assert_eq!(allocator.ledger().get("b1").await.unwrap().tasks_processed, 1);
    assert_consistent(db.as_ref(), &allocator, &task.id).await;
}

#[tokio::test]
async fn timed_out_completion_that_committed_is_whole_on_retry() {
    let (db, allocator, task) = flaky_pool().await;
    db.arm(Fault::AfterCommit);

    let err = allocator
        .complete(&worker("w1"), &task.id, payload(json!({"v": 1})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);

    let retry = allocator
        .complete(&worker("w1"), &task.id, payload(json!({"v": 2})))
        .await
        .unwrap_err();
    assert!(matches!(retry, TaskError::AlreadyCompleted { .. }));

    let answer = db.get_answer(&task.id, "w1").await.unwrap().unwrap();
    assert_eq!(answer.result["v"], 1);
    assert_eq!(allocator.ledger().get("b1").await.unwrap().tasks_processed, 1);
    assert_consistent(db.as_ref(), &allocator, &task.id).await;
}

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn import_runs_alongside_live_completions() {
    const TASKS: usize = 60;
    const REDUNDANCY: u32 = 2;

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let allocator = Arc::new(TaskAllocator::new(db.clone(), registry(REDUNDANCY)));
    let importer = Importer::new(allocator.clone(), "default").with_chunk_size(5);
    let handle = allocator.registry().resolve("declarations").unwrap();
    let loaded = Arc::new(AtomicBool::new(false));

    let import = {
        let loaded = loaded.clone();
        tokio::spawn(async move {
            let values = (0..TASKS).map(|i| json!({"n": i})).collect();
            let report = importer
                .import(&handle, records_from_values(values), "default")
                .await;
            loaded.store(true, Ordering::SeqCst);
            report
        })
    };

    let workers: Vec<_> = (0..3)
        .map(|i| {
            let allocator = allocator.clone();
            let loaded = loaded.clone();
            tokio::spawn(async move {
                let me = worker(&format!("w{i}"));
                let mut answered = 0u64;
                loop {
                    // Read before asking, so an empty answer after the load
                    // finished means the pool is drained for this worker.
                    let finished = loaded.load(Ordering::SeqCst);
                    match allocator.next(&me, "declarations").await.unwrap() {
                        Some(task) => match allocator.complete(&me, &task.id, Payload::new()).await {
                            Ok(_) => answered += 1,
                            Err(e) if e.is_precondition_violation() => {}
                            Err(e) => panic!("unexpected error: {e}"),
                        },
                        None if finished => break,
                        None => tokio::time::sleep(Duration::from_millis(1)).await,
                    }
                }
                answered
            })
        })
        .collect();

    let report = timeout(TEST_TIMEOUT, import)
        .await
        .expect("import hung")
        .unwrap()
        .unwrap();
    assert_eq!(report.imported, TASKS as u64);

    let answered: u64 = timeout(TEST_TIMEOUT, join_all(workers))
        .await
        .expect("workers hung")
        .into_iter()
        .map(|r| r.unwrap())
        .sum();

    let expected_answers = TASKS as u64 * REDUNDANCY as u64;
    assert_eq!(answered, expected_answers);
    assert_eq!(db.count_open_tasks("declarations").await.unwrap(), 0);

    let batch = allocator.ledger().get("default").await.unwrap();
    assert_eq!(batch.tasks_count, TASKS as u64);
    assert_eq!(batch.tasks_processed, TASKS as u64);

    let stored: u64 = taskpool::stats::leaders(db.as_ref(), "declarations")
        .await
        .unwrap()
        .iter()
        .map(|(_, n)| n)
        .sum();
    assert_eq!(stored, expected_answers);
}
