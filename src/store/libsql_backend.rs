//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Guarded updates are single
//! statements; the multi-row writes (`insert_tasks_counted`,
//! `complete_task_if_version`) run in one transaction and roll back on any
//! failed step.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Transaction, Value, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batches::model::Batch;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{CompletionWrite, Database, WorkerAnswerCount};
use crate::tasks::model::{Answer, Payload, Task};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// A transaction on that connection is visible to every statement issued
/// through it, so each operation holds `gate` for its full duration.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            gate: Mutex::new(()),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            gate: Mutex::new(()),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    async fn begin(&self, op: &str) -> Result<Transaction, DatabaseError> {
        self.conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} begin: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Map a write failure, surfacing unique-index violations as constraints.
fn write_err(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") || msg.contains("PRIMARY KEY") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn row_to_batch(row: &libsql::Row) -> Result<Batch, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("batch row parse: {e}"));
    Ok(Batch {
        id: row.get::<String>(0).map_err(parse)?,
        task_type: row.get::<String>(1).map_err(parse)?,
        tasks_count: row.get::<i64>(2).map_err(parse)?.max(0) as u64,
        tasks_processed: row.get::<i64>(3).map_err(parse)?.max(0) as u64,
    })
}

/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("task row parse: {e}"));
    let task_data: Payload = from_json(&row.get::<String>(3).map_err(parse)?)?;
    let users_processed: BTreeSet<String> = from_json(&row.get::<String>(6).map_err(parse)?)?;
    let users_skipped: BTreeSet<String> = from_json(&row.get::<String>(7).map_err(parse)?)?;

    Ok(Task {
        id: row.get::<String>(0).map_err(parse)?,
        task_type: row.get::<String>(1).map_err(parse)?,
        batch: row.get::<Option<String>>(2).map_err(parse)?,
        task_data,
        closed: row.get::<i64>(4).map_err(parse)? != 0,
        users_count: row.get::<i64>(5).map_err(parse)?.max(0) as u32,
        users_processed,
        users_skipped,
        version: row.get::<i64>(8).map_err(parse)?,
        created_at: parse_datetime(&row.get::<String>(9).map_err(parse)?),
    })
}

fn row_to_answer(row: &libsql::Row) -> Result<Answer, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("answer row parse: {e}"));
    let id_str: String = row.get(0).map_err(parse)?;
    Ok(Answer {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        task_id: row.get::<String>(1).map_err(parse)?,
        task_type: row.get::<String>(2).map_err(parse)?,
        created_by: row.get::<String>(3).map_err(parse)?,
        result: from_json(&row.get::<String>(4).map_err(parse)?)?,
        created_at: parse_datetime(&row.get::<String>(5).map_err(parse)?),
    })
}

fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(v) => Value::Text(v.to_string()),
        None => Value::Null,
    }
}

/// Multi-row INSERT for `tasks`. Every row starts open at version 1.
fn task_insert(tasks: &[Task]) -> Result<(String, Vec<Value>), DatabaseError> {
    let mut placeholders = Vec::with_capacity(tasks.len());
    let mut values: Vec<Value> = Vec::with_capacity(tasks.len() * TASK_INSERT_ARITY);
    for (i, task) in tasks.iter().enumerate() {
        let base = i * TASK_INSERT_ARITY;
        let row: Vec<String> = (1..=TASK_INSERT_ARITY)
            .map(|n| format!("?{}", base + n))
            .collect();
        placeholders.push(format!("({}, 1)", row.join(", ")));

        values.push(Value::Text(task.id.clone()));
        values.push(Value::Text(task.task_type.clone()));
        values.push(opt_text(task.batch.as_deref()));
        values.push(Value::Text(to_json(&task.task_data)?));
        values.push(Value::Integer(task.users_count as i64));
        values.push(Value::Text(to_json(&task.users_processed)?));
        values.push(Value::Text(to_json(&task.users_skipped)?));
        values.push(Value::Text(task.created_at.to_rfc3339()));
    }

    let sql = format!(
        "INSERT INTO tasks (id, task_type, batch_id, task_data, users_count, users_processed, users_skipped, created_at, version) VALUES {}",
        placeholders.join(", ")
    );
    Ok((sql, values))
}

async fn update_task_row(
    conn: &Connection,
    task: &Task,
    expected_version: i64,
) -> Result<bool, DatabaseError> {
    let updated = conn
        .execute(
            "UPDATE tasks SET closed = ?1, users_processed = ?2, users_skipped = ?3, version = version + 1
             WHERE id = ?4 AND version = ?5",
            params![
                task.closed as i64,
                to_json(&task.users_processed)?,
                to_json(&task.users_skipped)?,
                task.id.as_str(),
                expected_version,
            ],
        )
        .await
        .map_err(|e| write_err("update_task_if_version", e))?;
    Ok(updated > 0)
}

async fn insert_answer_row(conn: &Connection, answer: &Answer) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO answers (id, task_id, task_type, created_by, result, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            answer.id.to_string(),
            answer.task_id.as_str(),
            answer.task_type.as_str(),
            answer.created_by.as_str(),
            to_json(&answer.result)?,
            answer.created_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| write_err("insert_answer", e))?;
    Ok(())
}

/// Steps of a completion, run inside the caller's transaction. Any result
/// other than `Committed` must be rolled back.
async fn write_completion(
    conn: &Connection,
    task: &Task,
    expected_version: i64,
    answer: &Answer,
) -> Result<CompletionWrite, DatabaseError> {
    if !update_task_row(conn, task, expected_version).await? {
        return Ok(CompletionWrite::VersionConflict);
    }
    insert_answer_row(conn, answer).await?;

    if task.closed
        && let Some(batch_id) = task.batch.as_deref()
    {
        let counted = conn
            .execute(
                "UPDATE batches SET tasks_processed = tasks_processed + 1
                 WHERE id = ?1 AND tasks_processed < tasks_count",
                params![batch_id],
            )
            .await
            .map_err(|e| write_err("increment_batch_processed", e))?;
        if counted == 0 {
            return Ok(CompletionWrite::BatchRefused);
        }
    }
    Ok(CompletionWrite::Committed {
        version: expected_version + 1,
    })
}

async fn commit(tx: Transaction, op: &str) -> Result<(), DatabaseError> {
    tx.commit()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op} commit: {e}")))
}

async fn rollback(tx: Transaction, op: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(op, error = %e, "Rollback failed");
    }
}

// ── Trait implementation ────────────────────────────────────────────

const BATCH_COLUMNS: &str = "id, task_type, tasks_count, tasks_processed";

const TASK_COLUMNS: &str = "id, task_type, batch_id, task_data, closed, users_count, users_processed, users_skipped, version, created_at";

const ANSWER_COLUMNS: &str = "id, task_id, task_type, created_by, result, created_at";

/// Bound parameters per task row in `insert_tasks`.
const TASK_INSERT_ARITY: usize = 8;

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _gate = self.exclusive().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Batches ─────────────────────────────────────────────────────

    async fn insert_batch_if_absent(&self, batch: &Batch) -> Result<bool, DatabaseError> {
        let _gate = self.exclusive().await;
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO batches (id, task_type, tasks_count, tasks_processed) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    batch.id.as_str(),
                    batch.task_type.as_str(),
                    batch.tasks_count as i64,
                    batch.tasks_processed as i64,
                ],
            )
            .await
            .map_err(|e| write_err("insert_batch_if_absent", e))?;

        debug!(batch_id = %batch.id, inserted = inserted > 0, "Batch insert attempted");
        Ok(inserted > 0)
    }

    async fn get_batch(&self, id: &str) -> Result<Option<Batch>, DatabaseError> {
        let _gate = self.exclusive().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_batch: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_batch(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_batch: {e}"))),
        }
    }

    async fn increment_batch_count(
        &self,
        id: &str,
        task_type: &str,
        by: u64,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.exclusive().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE batches SET tasks_count = tasks_count + ?1 WHERE id = ?2 AND task_type = ?3",
                params![by as i64, id, task_type],
            )
            .await
            .map_err(|e| write_err("increment_batch_count", e))?;
        Ok(updated > 0)
    }

    async fn increment_batch_processed(&self, id: &str) -> Result<bool, DatabaseError> {
        let _gate = self.exclusive().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE batches SET tasks_processed = tasks_processed + 1
                 WHERE id = ?1 AND tasks_processed < tasks_count",
                params![id],
            )
            .await
            .map_err(|e| write_err("increment_batch_processed", e))?;
        Ok(updated > 0)
    }

    async fn list_batches(&self, task_type: &str) -> Result<Vec<Batch>, DatabaseError> {
        let _gate = self.exclusive().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE task_type = ?1 ORDER BY id ASC"),
                params![task_type],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_batches: {e}")))?;

        let mut batches = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_batches row: {e}")))?
        {
            batches.push(row_to_batch(&row)?);
        }
        Ok(batches)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), DatabaseError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let (sql, values) = task_insert(tasks)?;

        let _gate = self.exclusive().await;
        self.conn()
            .execute(&sql, Params::Positional(values))
            .await
            .map_err(|e| write_err("insert_tasks", e))?;

        debug!(count = tasks.len(), "Tasks inserted into DB");
        Ok(())
    }

    async fn insert_tasks_counted(
        &self,
        batch_id: &str,
        task_type: &str,
        tasks: &[Task],
    ) -> Result<bool, DatabaseError> {
        let insert = if tasks.is_empty() {
            None
        } else {
            Some(task_insert(tasks)?)
        };

        let _gate = self.exclusive().await;
        let tx = self.begin("insert_tasks_counted").await?;
        let extended = tx
            .execute(
                "UPDATE batches SET tasks_count = tasks_count + ?1 WHERE id = ?2 AND task_type = ?3",
                params![tasks.len() as i64, batch_id, task_type],
            )
            .await;
        let counted = match extended {
            Ok(n) => n > 0,
            Err(e) => {
                rollback(tx, "insert_tasks_counted").await;
                return Err(write_err("insert_tasks_counted", e));
            }
        };
        if !counted {
            rollback(tx, "insert_tasks_counted").await;
            debug!(batch_id, task_type, "Batch refused task count");
            return Ok(false);
        }

        if let Some((sql, values)) = insert {
            let inserted = tx.execute(&sql, Params::Positional(values)).await;
            if let Err(e) = inserted {
                rollback(tx, "insert_tasks_counted").await;
                return Err(write_err("insert_tasks", e));
            }
        }
        commit(tx, "insert_tasks_counted").await?;

        debug!(batch_id, count = tasks.len(), "Tasks inserted and counted");
        Ok(true)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError> {
        let _gate = self.exclusive().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    async fn find_candidate_task(
        &self,
        task_type: &str,
        worker_id: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        let _gate = self.exclusive().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE task_type = ?1 AND closed = 0
                       AND NOT EXISTS (SELECT 1 FROM json_each(tasks.users_processed) WHERE json_each.value = ?2)
                       AND NOT EXISTS (SELECT 1 FROM json_each(tasks.users_skipped) WHERE json_each.value = ?2)
                     ORDER BY rowid ASC
                     LIMIT 1"
                ),
                params![task_type, worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_candidate_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_candidate_task row: {e}"))),
        }
    }

    async fn update_task_if_version(
        &self,
        task: &Task,
        expected_version: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        let _gate = self.exclusive().await;
        if !update_task_row(self.conn(), task, expected_version).await? {
            debug!(task_id = %task.id, expected_version, "Task version conflict");
            return Ok(None);
        }
        Ok(Some(expected_version + 1))
    }

    async fn complete_task_if_version(
        &self,
        task: &Task,
        expected_version: i64,
        answer: &Answer,
    ) -> Result<CompletionWrite, DatabaseError> {
        let _gate = self.exclusive().await;
        let tx = self.begin("complete_task_if_version").await?;
        let outcome = write_completion(&tx, task, expected_version, answer).await;
        match outcome {
            Ok(CompletionWrite::Committed { version }) => {
                commit(tx, "complete_task_if_version").await?;
                debug!(task_id = %task.id, worker = %answer.created_by, closed = task.closed, "Completion committed");
                Ok(CompletionWrite::Committed { version })
            }
            outcome => {
                rollback(tx, "complete_task_if_version").await;
                if let Ok(write) = &outcome {
                    debug!(task_id = %task.id, expected_version, ?write, "Completion not applied");
                }
                outcome
            }
        }
    }

    async fn count_tasks(&self, task_type: &str) -> Result<u64, DatabaseError> {
        let _gate = self.exclusive().await;
        count(self.conn(), "SELECT COUNT(*) FROM tasks WHERE task_type = ?1", task_type).await
    }

    async fn count_open_tasks(&self, task_type: &str) -> Result<u64, DatabaseError> {
        let _gate = self.exclusive().await;
        count(
            self.conn(),
            "SELECT COUNT(*) FROM tasks WHERE task_type = ?1 AND closed = 0",
            task_type,
        )
        .await
    }

    // ── Answers ─────────────────────────────────────────────────────

    async fn get_answer(
        &self,
        task_id: &str,
        created_by: &str,
    ) -> Result<Option<Answer>, DatabaseError> {
        let _gate = self.exclusive().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ANSWER_COLUMNS} FROM answers WHERE task_id = ?1 AND created_by = ?2"),
                params![task_id, created_by],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_answer: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_answer(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_answer row: {e}"))),
        }
    }

    async fn answer_counts_by_worker(
        &self,
        task_type: &str,
    ) -> Result<Vec<WorkerAnswerCount>, DatabaseError> {
        let _gate = self.exclusive().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT created_by, COUNT(*) AS answers FROM answers WHERE task_type = ?1
                 GROUP BY created_by ORDER BY answers DESC, created_by ASC",
                params![task_type],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("answer_counts_by_worker: {e}")))?;

        let mut counts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("answer_counts_by_worker row: {e}")))?
        {
            let parse = |e: libsql::Error| DatabaseError::Query(format!("answer count parse: {e}"));
            counts.push(WorkerAnswerCount {
                worker: row.get::<String>(0).map_err(parse)?,
                answers: row.get::<i64>(1).map_err(parse)?.max(0) as u64,
            });
        }
        Ok(counts)
    }
}

async fn count(conn: &Connection, sql: &str, task_type: &str) -> Result<u64, DatabaseError> {
    let mut rows = conn
        .query(sql, params![task_type])
        .await
        .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let n: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("count parse: {e}")))?;
            Ok(n.max(0) as u64)
        }
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!("count row: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_task(task_type: &str, batch: Option<&str>) -> Task {
        let data = json!({"text": "hello"}).as_object().cloned().unwrap();
        Task::new(task_type, batch.map(String::from), data, 2)
    }

    #[tokio::test]
    async fn batch_insert_is_conditional() {
        let db = test_db().await;
        let batch = Batch::new("b1", "declarations", 10);

        assert!(db.insert_batch_if_absent(&batch).await.unwrap());
        assert!(!db.insert_batch_if_absent(&batch).await.unwrap());

        let fetched = db.get_batch("b1").await.unwrap().unwrap();
        assert_eq!(fetched, batch);
    }

    #[tokio::test]
    async fn batch_count_guarded_by_type() {
        let db = test_db().await;
        db.insert_batch_if_absent(&Batch::new("default", "declarations", 10))
            .await
            .unwrap();

        assert!(db.increment_batch_count("default", "declarations", 5).await.unwrap());
        assert!(!db.increment_batch_count("default", "photos", 5).await.unwrap());
        assert!(!db.increment_batch_count("missing", "declarations", 5).await.unwrap());

        let fetched = db.get_batch("default").await.unwrap().unwrap();
        assert_eq!(fetched.tasks_count, 15);
    }

    #[tokio::test]
    async fn batch_processed_capped_by_count() {
        let db = test_db().await;
        db.insert_batch_if_absent(&Batch::new("b1", "declarations", 2))
            .await
            .unwrap();

        assert!(db.increment_batch_processed("b1").await.unwrap());
        assert!(db.increment_batch_processed("b1").await.unwrap());
        assert!(!db.increment_batch_processed("b1").await.unwrap());

        let fetched = db.get_batch("b1").await.unwrap().unwrap();
        assert_eq!(fetched.tasks_processed, 2);
        assert!(fetched.is_exhausted());
    }

    #[tokio::test]
    async fn list_batches_by_type() {
        let db = test_db().await;
        db.insert_batch_if_absent(&Batch::new("b2", "declarations", 1)).await.unwrap();
        db.insert_batch_if_absent(&Batch::new("b1", "declarations", 1)).await.unwrap();
        db.insert_batch_if_absent(&Batch::new("p1", "photos", 1)).await.unwrap();

        let batches = db.list_batches("declarations").await.unwrap();
        let ids: Vec<&str> = batches.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn insert_and_get_tasks() {
        let db = test_db().await;
        let tasks = vec![
            make_task("declarations", Some("b1")),
            make_task("declarations", None),
        ];
        db.insert_tasks(&tasks).await.unwrap();

        let fetched = db.get_task(&tasks[0].id).await.unwrap().unwrap();
        assert_eq!(fetched.batch.as_deref(), Some("b1"));
        assert_eq!(fetched.task_data["text"], "hello");
        assert_eq!(fetched.users_count, 2);
        assert_eq!(fetched.version, 1);
        assert!(!fetched.closed);

        let second = db.get_task(&tasks[1].id).await.unwrap().unwrap();
        assert!(second.batch.is_none());
        assert_eq!(db.count_tasks("declarations").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn insert_tasks_is_all_or_nothing() {
        let db = test_db().await;
        let existing = make_task("declarations", None);
        db.insert_tasks(std::slice::from_ref(&existing)).await.unwrap();

        let fresh = make_task("declarations", None);
        let result = db.insert_tasks(&[fresh.clone(), existing]).await;
        assert!(matches!(result, Err(DatabaseError::Constraint(_))));
        assert!(db.get_task(&fresh.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let db = test_db().await;
        assert!(db.get_task("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn candidate_excludes_seen_and_closed() {
        let db = test_db().await;
        let mut processed = make_task("declarations", None);
        processed.users_processed.insert("w1".into());
        let mut skipped = make_task("declarations", None);
        skipped.users_skipped.insert("w1".into());
        let mut closed = make_task("declarations", None);
        closed.closed = true;
        let other_type = make_task("photos", None);
        db.insert_tasks(&[processed, skipped, other_type]).await.unwrap();
        db.insert_tasks(std::slice::from_ref(&closed)).await.unwrap();
        // insert_tasks always writes open rows; close explicitly.
        db.update_task_if_version(&closed, 1).await.unwrap();

        assert!(db.find_candidate_task("declarations", "w1").await.unwrap().is_none());
        let for_w2 = db.find_candidate_task("declarations", "w2").await.unwrap();
        assert!(for_w2.is_some());
        assert!(!for_w2.unwrap().closed);
    }

    #[tokio::test]
    async fn update_task_compare_and_set() {
        let db = test_db().await;
        let task = make_task("declarations", None);
        db.insert_tasks(std::slice::from_ref(&task)).await.unwrap();

        let mut current = db.get_task(&task.id).await.unwrap().unwrap();
        current.users_processed.insert("w1".into());
        let new_version = db.update_task_if_version(&current, current.version).await.unwrap();
        assert_eq!(new_version, Some(2));

        // Stale version loses.
        current.users_processed.insert("w2".into());
        assert_eq!(db.update_task_if_version(&current, 1).await.unwrap(), None);

        let fetched = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.users_processed.len(), 1);
    }

    /// Adds `worker` to the stored task and completes it at the stored version.
    async fn answer(db: &LibSqlBackend, task_id: &str, worker: &str) -> CompletionWrite {
        let mut task = db.get_task(task_id).await.unwrap().unwrap();
        let version = task.version;
        task.users_processed.insert(worker.into());
        task.closed = task.redundancy_met();
        let answer = Answer::new(&task, worker, json!({"ok": true}).as_object().cloned().unwrap());
        db.complete_task_if_version(&task, version, &answer).await.unwrap()
    }

    #[tokio::test]
    async fn completion_writes_task_answer_and_batch() {
        let db = test_db().await;
        db.insert_batch_if_absent(&Batch::new("b1", "declarations", 1)).await.unwrap();
        let task = make_task("declarations", Some("b1"));
        db.insert_tasks(std::slice::from_ref(&task)).await.unwrap();

        assert_eq!(answer(&db, &task.id, "w1").await, CompletionWrite::Committed { version: 2 });
        assert_eq!(db.get_batch("b1").await.unwrap().unwrap().tasks_processed, 0);

        assert_eq!(answer(&db, &task.id, "w2").await, CompletionWrite::Committed { version: 3 });
        let stored = db.get_task(&task.id).await.unwrap().unwrap();
        assert!(stored.closed);
        assert_eq!(stored.users_processed.len(), 2);
        assert_eq!(db.get_batch("b1").await.unwrap().unwrap().tasks_processed, 1);

        let fetched = db.get_answer(&task.id, "w1").await.unwrap().unwrap();
        assert_eq!(fetched.result["ok"], true);
        assert!(db.get_answer(&task.id, "w3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completion_at_stale_version_writes_nothing() {
        let db = test_db().await;
        let task = make_task("declarations", None);
        db.insert_tasks(std::slice::from_ref(&task)).await.unwrap();

        let mut stale = task.clone();
        stale.users_processed.insert("w1".into());
        let answer = Answer::new(&stale, "w1", Payload::new());
        let outcome = db.complete_task_if_version(&stale, 7, &answer).await.unwrap();
        assert_eq!(outcome, CompletionWrite::VersionConflict);

        let stored = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert!(stored.users_processed.is_empty());
        assert!(db.get_answer(&task.id, "w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_answer_rolls_back_the_task_update() {
        let db = test_db().await;
        let task = make_task("declarations", None);
        db.insert_tasks(std::slice::from_ref(&task)).await.unwrap();
        answer(&db, &task.id, "w1").await;

        // A second answer from w1 passes the version guard, then collides.
        let mut current = db.get_task(&task.id).await.unwrap().unwrap();
        current.users_processed.insert("w2".into());
        current.closed = true;
        let dup = Answer::new(&current, "w1", Payload::new());
        let result = db.complete_task_if_version(&current, current.version, &dup).await;
        assert!(matches!(result, Err(DatabaseError::Constraint(_))));

        let stored = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert!(!stored.closed);
        assert_eq!(stored.users_processed.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_batch_refuses_the_whole_completion() {
        let db = test_db().await;
        db.insert_batch_if_absent(&Batch::new("b1", "declarations", 0)).await.unwrap();
        let mut task = make_task("declarations", Some("b1"));
        task.users_count = 1;
        db.insert_tasks(std::slice::from_ref(&task)).await.unwrap();

        assert_eq!(answer(&db, &task.id, "w1").await, CompletionWrite::BatchRefused);

        let stored = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert!(!stored.closed);
        assert!(stored.users_processed.is_empty());
        assert!(db.get_answer(&task.id, "w1").await.unwrap().is_none());
        assert_eq!(db.get_batch("b1").await.unwrap().unwrap().tasks_processed, 0);
    }

    #[tokio::test]
    async fn counted_insert_extends_batch_with_rows() {
        let db = test_db().await;
        db.insert_batch_if_absent(&Batch::new("b1", "declarations", 0)).await.unwrap();
        let tasks = vec![
            make_task("declarations", Some("b1")),
            make_task("declarations", Some("b1")),
        ];

        assert!(db.insert_tasks_counted("b1", "declarations", &tasks).await.unwrap());
        assert_eq!(db.get_batch("b1").await.unwrap().unwrap().tasks_count, 2);
        assert_eq!(db.count_tasks("declarations").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn counted_insert_refused_writes_no_rows() {
        let db = test_db().await;
        db.insert_batch_if_absent(&Batch::new("p1", "photos", 0)).await.unwrap();
        let tasks = vec![make_task("declarations", Some("p1"))];

        assert!(!db.insert_tasks_counted("p1", "declarations", &tasks).await.unwrap());
        assert!(!db.insert_tasks_counted("missing", "declarations", &tasks).await.unwrap());
        assert!(db.get_task(&tasks[0].id).await.unwrap().is_none());
        assert_eq!(db.get_batch("p1").await.unwrap().unwrap().tasks_count, 0);
    }

    #[tokio::test]
    async fn counted_insert_collision_keeps_count() {
        let db = test_db().await;
        db.insert_batch_if_absent(&Batch::new("b1", "declarations", 0)).await.unwrap();
        let existing = make_task("declarations", Some("b1"));
        db.insert_tasks_counted("b1", "declarations", std::slice::from_ref(&existing))
            .await
            .unwrap();

        let result = db
            .insert_tasks_counted("b1", "declarations", &[make_task("declarations", Some("b1")), existing])
            .await;
        assert!(matches!(result, Err(DatabaseError::Constraint(_))));
        assert_eq!(db.get_batch("b1").await.unwrap().unwrap().tasks_count, 1);
        assert_eq!(db.count_tasks("declarations").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn answer_counts_ordered() {
        let db = test_db().await;
        let tasks = vec![
            make_task("declarations", None),
            make_task("declarations", None),
        ];
        db.insert_tasks(&tasks).await.unwrap();
        for task in &tasks {
            answer(&db, &task.id, "busy").await;
        }
        answer(&db, &tasks[0].id, "casual").await;

        let counts = db.answer_counts_by_worker("declarations").await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].worker, "busy");
        assert_eq!(counts[0].answers, 2);
        assert_eq!(counts[1].answers, 1);
        assert!(db.answer_counts_by_worker("photos").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("pool.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(path.exists());
        drop(db);
    }
}
