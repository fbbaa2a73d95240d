use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Named queue a task is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Queue {
    /// Batched metadata fetches.
    Apidata,
    /// Rate-limited per-item hashing.
    Hash,
    /// Batched exports to the bulk loader.
    Export,
}

impl Queue {
    pub const ALL: [Queue; 3] = [Queue::Apidata, Queue::Hash, Queue::Export];

    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Apidata => "apidata",
            Queue::Hash => "hash",
            Queue::Export => "export",
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Queue {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "apidata" => Ok(Queue::Apidata),
            "hash" => Ok(Queue::Hash),
            "export" => Ok(Queue::Export),
            _ => Err(AppError::InvalidValue(format!("Unknown queue: {s}"))),
        }
    }
}

/// Unit of work carried by the message queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// Claim these `queued` items and fetch their metadata in one request.
    FetchMetadata { work_ids: Vec<i64> },
    /// Hash one item's artifact. `claim_token` is the fetch claim that
    /// still owns the item.
    ComputeHash {
        work_id: i64,
        image_url: String,
        claim_token: Uuid,
    },
    /// Claim these `queued_export` items and send them to the loader.
    Export { work_ids: Vec<i64> },
}

impl Task {
    pub fn queue(&self) -> Queue {
        match self {
            Task::FetchMetadata { .. } => Queue::Apidata,
            Task::ComputeHash { .. } => Queue::Hash,
            Task::Export { .. } => Queue::Export,
        }
    }

    /// Number of work items this task touches.
    pub fn len(&self) -> usize {
        match self {
            Task::FetchMetadata { work_ids } | Task::Export { work_ids } => work_ids.len(),
            Task::ComputeHash { .. } => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which task an enqueue run triggers for each sub-batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    FetchMetadata,
    Export,
}

impl TaskKind {
    pub fn build(&self, work_ids: Vec<i64>) -> Task {
        match self {
            TaskKind::FetchMetadata => Task::FetchMetadata { work_ids },
            TaskKind::Export => Task::Export { work_ids },
        }
    }
}

/// Status of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(AppError::InvalidValue(format!("Unknown task status: {s}"))),
        }
    }
}

/// A task as stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: Uuid,
    pub queue: Queue,
    pub task: Task,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueuedTask {
    /// Whether another attempt is allowed after the current one fails.
    pub fn can_retry(&self) -> bool {
        self.attempts + 1 < self.max_attempts
    }
}

/// Bounded retry with exponential backoff.
///
/// Delay for attempt `n` (1-indexed) is `base_delay * 2^(n-1)`, capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: TimeDelta,
    pub max_delay: TimeDelta,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: TimeDelta::seconds(30),
            max_delay: TimeDelta::minutes(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: TimeDelta, max_delay: TimeDelta) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Whether a task that has already failed `attempts` times may run
    /// again under this policy.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts + 1 < self.max_attempts
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .checked_mul(1i32 << exponent)
            .unwrap_or(self.max_delay);
        std::cmp::min(delay, self.max_delay)
    }

    pub fn next_run_at(&self, attempt: u32) -> DateTime<Utc> {
        Utc::now() + self.delay_for_attempt(attempt)
    }
}

/// Configuration for a task worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub queues: Vec<Queue>,
    pub poll_interval: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            queues: Queue::ALL.to_vec(),
            poll_interval: Duration::from_secs(5),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_queues(mut self, queues: Vec<Queue>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}
