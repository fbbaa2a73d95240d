use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::task::{Queue, QueuedTask, Task, TaskStatus};

/// Persistent message queue for pipeline tasks.
///
/// Implementations must support atomic claiming via `SELECT FOR UPDATE SKIP LOCKED`
/// or equivalent to prevent multiple workers from claiming the same task.
pub trait TaskQueue: Send + Sync + Clone {
    fn enqueue(
        &self,
        task: &Task,
        max_attempts: u32,
    ) -> impl Future<Output = Result<QueuedTask, AppError>> + Send;

    /// Atomically claim the next runnable task from any of `queues`.
    ///
    /// Returns `None` if no tasks are available.
    fn claim_task(
        &self,
        queues: &[Queue],
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<QueuedTask>, AppError>> + Send;

    fn complete_task(&self, task_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Mark a task as failed. If `next_run_at` is provided, the task is
    /// reset to `pending` with its attempt counter incremented; otherwise
    /// it is marked as permanently `failed`.
    fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_task(
        &self,
        task_id: Uuid,
    ) -> impl Future<Output = Result<Option<QueuedTask>, AppError>> + Send;

    /// Release all tasks held by a specific worker (for graceful shutdown).
    fn release_worker_tasks(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn count_by_status(
        &self,
        status: TaskStatus,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;
}
