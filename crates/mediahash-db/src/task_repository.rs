use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use mediahash_core::error::AppError;
use mediahash_core::task::{Queue, QueuedTask, Task, TaskStatus};
use mediahash_core::task_queue::TaskQueue;

/// PostgreSQL-backed task queue using `SELECT FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct TaskRepository {
    pool: Pool<Postgres>,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pending task counts per queue, for the `stats` command.
    pub async fn pending_by_queue(&self) -> Result<Vec<(Queue, i64)>, AppError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT queue, COUNT(*) FROM tasks
            WHERE status = 'pending'
            GROUP BY queue
            ORDER BY queue
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter()
            .map(|(queue, count)| queue.parse::<Queue>().map(|q| (q, count)))
            .collect()
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    queue: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_run_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    worker_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for QueuedTask {
    type Error = AppError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(QueuedTask {
            id: row.id,
            queue: row.queue.parse()?,
            task: serde_json::from_value(row.payload)?,
            status: row.status.parse()?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            next_run_at: row.next_run_at,
            error_message: row.error_message,
            worker_id: row.worker_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

impl TaskQueue for TaskRepository {
    async fn enqueue(&self, task: &Task, max_attempts: u32) -> Result<QueuedTask, AppError> {
        let payload = serde_json::to_value(task)?;
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO tasks (queue, payload, max_attempts)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(task.queue().as_str())
        .bind(payload)
        .bind(max_attempts.max(1) as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.try_into()
    }

    async fn claim_task(
        &self,
        queues: &[Queue],
        worker_id: &str,
    ) -> Result<Option<QueuedTask>, AppError> {
        let names: Vec<String> = queues.iter().map(|q| q.as_str().to_string()).collect();
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = 'running', worker_id = $2, started_at = NOW(), updated_at = NOW()
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'pending'
                  AND queue = ANY($1)
                  AND (next_run_at IS NULL OR next_run_at <= NOW())
                ORDER BY next_run_at NULLS FIRST, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(names)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(QueuedTask::try_from).transpose()
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed', completed_at = NOW(), updated_at = NOW(),
                error_message = NULL, worker_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        // A retry time puts the task back in line; no retry time is final.
        sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = CASE WHEN $3::timestamptz IS NOT NULL THEN 'pending' ELSE 'failed' END,
                attempts = CASE WHEN $3::timestamptz IS NOT NULL THEN attempts + 1 ELSE attempts END,
                next_run_at = $3,
                error_message = $2,
                worker_id = NULL,
                started_at = CASE WHEN $3::timestamptz IS NOT NULL THEN NULL ELSE started_at END,
                completed_at = CASE WHEN $3::timestamptz IS NOT NULL THEN NULL ELSE NOW() END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(error)
        .bind(next_run_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<QueuedTask>, AppError> {
        let row = sqlx::query_as::<_, TaskRow>(r#"SELECT * FROM tasks WHERE id = $1"#)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(QueuedTask::try_from).transpose()
    }

    async fn release_worker_tasks(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', worker_id = NULL, started_at = NULL, updated_at = NOW()
            WHERE worker_id = $1 AND status = 'running'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM tasks WHERE status = $1"#)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count)
    }
}
