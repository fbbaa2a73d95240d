use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::enrich::{HashOutcome, HashStage};
use crate::error::AppError;
use crate::export::{ExportOutcome, ExportStage};
use crate::fetch::{FetchOutcome, FetchStage};
use crate::rate_limit::RateLimiter;
use crate::task::{Queue, QueuedTask, Task, WorkerConfig};
use crate::task_queue::TaskQueue;
use crate::traits::{ArtifactFetcher, BulkLoader, MetadataProvider, PerceptualHasher, WorkStore};

/// What a successfully handled task did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Fetched(FetchOutcome),
    Hashed(HashOutcome),
    Exported(ExportOutcome),
}

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
        queues: &'a [Queue],
    },
    Polling,
    TaskClaimed {
        task: &'a QueuedTask,
    },
    TaskCompleted {
        task_id: Uuid,
        result: &'a TaskResult,
    },
    TaskFailed {
        task_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    ShuttingDown {
        worker_id: &'a str,
        tasks_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id, queues } => {
                let queues: Vec<&str> = queues.iter().map(Queue::as_str).collect();
                tracing::info!(%worker_id, ?queues, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::debug!("Polling for tasks");
            }
            WorkerEvent::TaskClaimed { task } => {
                tracing::info!(
                    task_id = %task.id,
                    queue = %task.queue,
                    works = task.task.len(),
                    attempt = task.attempts + 1,
                    "Task claimed"
                );
            }
            WorkerEvent::TaskCompleted { task_id, result } => {
                tracing::info!(%task_id, ?result, "Task completed");
            }
            WorkerEvent::TaskFailed {
                task_id,
                error,
                will_retry,
            } => {
                tracing::warn!(%task_id, %error, %will_retry, "Task failed");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                tasks_released,
            } => {
                tracing::info!(%worker_id, %tasks_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// Worker that polls the task queue and runs each task through its stage.
pub struct WorkerService<S, Q, P, R, F, H, L>
where
    S: WorkStore,
    Q: TaskQueue,
    P: MetadataProvider,
    R: RateLimiter,
    F: ArtifactFetcher,
    H: PerceptualHasher,
    L: BulkLoader,
{
    queue: Q,
    fetch: FetchStage<S, P, Q>,
    hash: HashStage<S, R, F, H>,
    export: ExportStage<S, L>,
    config: WorkerConfig,
}

impl<S, Q, P, R, F, H, L> WorkerService<S, Q, P, R, F, H, L>
where
    S: WorkStore,
    Q: TaskQueue,
    P: MetadataProvider,
    R: RateLimiter,
    F: ArtifactFetcher,
    H: PerceptualHasher,
    L: BulkLoader,
{
    pub fn new(
        queue: Q,
        fetch: FetchStage<S, P, Q>,
        hash: HashStage<S, R, F, H>,
        export: ExportStage<S, L>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            fetch,
            hash,
            export,
            config,
        }
    }

    /// Run the worker loop until cancellation.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
            queues: &self.config.queues,
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            match self.run_once(reporter).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim task");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        // Graceful shutdown: hand running tasks back to the queue
        let released = match self.queue.release_worker_tasks(&self.config.worker_id).await {
            Ok(released) => released,
            Err(e) => {
                tracing::error!(error = %e, "Failed to release worker tasks");
                0
            }
        };

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            tasks_released: released,
        });
        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    /// Claim and process a single task. Returns `false` when every
    /// configured queue was empty.
    pub async fn run_once<WR: WorkerReporter>(&self, reporter: &WR) -> Result<bool, AppError> {
        reporter.report(WorkerEvent::Polling);

        let Some(task) = self
            .queue
            .claim_task(&self.config.queues, &self.config.worker_id)
            .await?
        else {
            return Ok(false);
        };

        reporter.report(WorkerEvent::TaskClaimed { task: &task });
        self.process_task(&task, reporter).await;
        Ok(true)
    }

    async fn process_task<WR: WorkerReporter>(&self, task: &QueuedTask, reporter: &WR) {
        match self.dispatch(&task.task).await {
            Ok(result) => {
                reporter.report(WorkerEvent::TaskCompleted {
                    task_id: task.id,
                    result: &result,
                });
                if let Err(e) = self.queue.complete_task(task.id).await {
                    tracing::error!(task_id = %task.id, error = %e, "Failed to mark task completed");
                }
            }
            Err(e) => {
                let error_msg = e.to_string();
                let will_retry = e.is_retryable()
                    && task.can_retry()
                    && self.config.retry_policy.allows_retry(task.attempts);
                reporter.report(WorkerEvent::TaskFailed {
                    task_id: task.id,
                    error: &error_msg,
                    will_retry,
                });

                let next_run_at = will_retry
                    .then(|| self.config.retry_policy.next_run_at(task.attempts + 1));

                if let Err(e) = self.queue.fail_task(task.id, &error_msg, next_run_at).await {
                    tracing::error!(task_id = %task.id, error = %e, "Failed to mark task as failed");
                }
            }
        }
    }

    async fn dispatch(&self, task: &Task) -> Result<TaskResult, AppError> {
        match task {
            Task::FetchMetadata { work_ids } => {
                self.fetch.process_ids(work_ids).await.map(TaskResult::Fetched)
            }
            Task::ComputeHash {
                work_id,
                image_url,
                claim_token,
            } => self
                .hash
                .run(*work_id, image_url, *claim_token)
                .await
                .map(TaskResult::Hashed),
            Task::Export { work_ids } => {
                self.export.process_ids(work_ids).await.map(TaskResult::Exported)
            }
        }
    }
}
