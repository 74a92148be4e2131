//! Leaderboard and per-worker standing, derived from stored answers.

use serde::Serialize;

use crate::error::DatabaseError;
use crate::store::Database;

/// A worker's answer total and dense rank for one task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub total: u64,
    pub position: u64,
}

/// `(worker, answers)` pairs, most answers first.
pub async fn leaders(db: &dyn Database, task_type: &str) -> Result<Vec<(String, u64)>, DatabaseError> {
    Ok(db
        .answer_counts_by_worker(task_type)
        .await?
        .into_iter()
        .map(|c| (c.worker, c.answers))
        .collect())
}

/// Standing of `worker_id` among everyone who answered `task_type`.
///
/// Workers with equal totals share a position. A worker with no answers
/// gets `total = 0` and the lowest occupied position.
pub async fn worker_stats(
    db: &dyn Database,
    task_type: &str,
    worker_id: &str,
) -> Result<WorkerStats, DatabaseError> {
    let board = leaders(db, task_type).await?;
    Ok(rank(&board, worker_id))
}

fn rank(board: &[(String, u64)], worker_id: &str) -> WorkerStats {
    let mut position = 0;
    let mut previous = None;
    for (worker, answers) in board {
        if previous != Some(*answers) {
            position += 1;
            previous = Some(*answers);
        }
        if worker == worker_id {
            return WorkerStats {
                total: *answers,
                position,
            };
        }
    }
    WorkerStats { total: 0, position }
}
