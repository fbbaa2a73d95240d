pub mod claim;
pub mod enqueue;
pub mod enrich;
pub mod error;
pub mod export;
pub mod fetch;
pub mod metadata;
pub mod orchestrator;
pub mod rate_limit;
pub mod task;
pub mod task_queue;
pub mod traits;
pub mod work;
pub mod worker;

#[cfg(test)]
mod testutil;

pub use claim::{Claim, ClaimConfig, ClaimProtocol};
pub use enqueue::{EnqueueReport, EnqueueRequest, enqueue};
pub use enrich::{HashOutcome, HashStage};
pub use error::AppError;
pub use export::{ExportDocument, ExportOutcome, ExportStage, document_line};
pub use fetch::{FetchConfig, FetchOutcome, FetchStage, MissingEntryPolicy};
pub use metadata::FileMetadata;
pub use orchestrator::{Orchestrator, OrchestratorConfig, TracingCycleReporter};
pub use rate_limit::{RateLimit, RateLimiter, TokenBucket};
pub use task::{Queue, QueuedTask, RetryPolicy, Task, TaskKind, TaskStatus, WorkerConfig};
pub use task_queue::TaskQueue;
pub use traits::{ArtifactFetcher, BulkLoader, MetadataProvider, PerceptualHasher, WorkStore};
pub use work::{Handler, NewWork, WorkItem, WorkStatus};
pub use worker::{TracingWorkerReporter, WorkerService};
