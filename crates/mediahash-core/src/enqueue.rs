//! Operator-driven enqueue: move items between statuses in small batches
//! and schedule a task per batch.

use crate::claim::DEFAULT_BATCH_SIZE;
use crate::error::AppError;
use crate::task::TaskKind;
use crate::task_queue::TaskQueue;
use crate::traits::WorkStore;
use crate::work::{UpdateGuard, WorkStatus, WorkUpdate};

/// Progress is reported each time this many more items have been moved.
pub const PROGRESS_EVERY: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub from: WorkStatus,
    pub to: WorkStatus,
    pub kind: TaskKind,
    pub max_count: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
}

impl EnqueueRequest {
    /// `idle -> queued`, one metadata fetch per batch.
    pub fn fetch(max_count: u64) -> Self {
        Self {
            from: WorkStatus::Idle,
            to: WorkStatus::Queued,
            kind: TaskKind::FetchMetadata,
            max_count,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: 5,
        }
    }

    /// `done -> queued_export`, one export per batch.
    pub fn export(max_count: u64) -> Self {
        Self {
            from: WorkStatus::Done,
            to: WorkStatus::QueuedExport,
            kind: TaskKind::Export,
            max_count,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: 1,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, DEFAULT_BATCH_SIZE);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueReport {
    pub moved: u64,
    pub tasks: u64,
    /// The source status ran dry before `max_count` was reached.
    pub exhausted: bool,
}

/// Move up to `request.max_count` items from `from` to `to`, scheduling
/// one task per batch. `progress` is called with the running total every
/// [`PROGRESS_EVERY`] items.
pub async fn enqueue<S, Q, P>(
    store: &S,
    queue: &Q,
    request: &EnqueueRequest,
    mut progress: P,
) -> Result<EnqueueReport, AppError>
where
    S: WorkStore,
    Q: TaskQueue,
    P: FnMut(u64),
{
    let mut report = EnqueueReport::default();
    let mut next_progress = PROGRESS_EVERY;
    let update = WorkUpdate::new().status(request.to);

    while report.moved < request.max_count {
        let remaining = request.max_count - report.moved;
        let limit = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(request.batch_size.max(1));

        let ids = store.select_batch(request.from, limit).await?;
        if ids.is_empty() {
            tracing::info!(from = %request.from, moved = report.moved, "No more works to enqueue");
            report.exhausted = true;
            break;
        }

        let moved = store
            .conditional_update(&ids, UpdateGuard::unclaimed(request.from), &update)
            .await?;
        if moved == 0 {
            continue;
        }

        // Another process may have taken some of the selected rows between
        // the select and the update; only schedule the ones now in `to`.
        let ids = if moved as usize == ids.len() {
            ids
        } else {
            store
                .get_by_ids(&ids)
                .await?
                .into_iter()
                .filter(|w| w.status == request.to && w.claim_token.is_none())
                .map(|w| w.id)
                .collect()
        };

        queue
            .enqueue(&request.kind.build(ids), request.max_attempts)
            .await?;
        report.moved += moved;
        report.tasks += 1;

        while report.moved >= next_progress {
            progress(report.moved);
            next_progress += PROGRESS_EVERY;
        }
    }

    tracing::info!(
        from = %request.from,
        to = %request.to,
        moved = report.moved,
        tasks = report.tasks,
        "Enqueue finished"
    );
    Ok(report)
}
