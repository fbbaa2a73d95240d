//! Remote fetch stage: one provider round trip per claimed batch.

use crate::claim::{Claim, ClaimProtocol};
use crate::error::AppError;
use crate::metadata::FileMetadata;
use crate::task::Task;
use crate::task_queue::TaskQueue;
use crate::traits::{MetadataProvider, WorkStore};
use crate::work::{WorkItem, WorkStatus, WorkUpdate};

/// What to do with a claimed item the provider did not describe usably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingEntryPolicy {
    /// Log it and leave it claimed in `processing`. Only a stale-claim
    /// sweep brings it back.
    #[default]
    LeaveClaimed,
    /// Mark it `error` and clear the claim.
    MarkError,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub missing_entry: MissingEntryPolicy,
    /// `max_attempts` given to the hash tasks this stage fans out.
    pub hash_max_attempts: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            missing_entry: MissingEntryPolicy::default(),
            hash_max_attempts: 1,
        }
    }
}

impl FetchConfig {
    pub fn with_missing_entry(mut self, policy: MissingEntryPolicy) -> Self {
        self.missing_entry = policy;
        self
    }
}

/// Per-batch result of the fetch stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub claimed: usize,
    /// Moved straight to `done`.
    pub done: usize,
    /// Handed to the hash stage.
    pub hash_enqueued: usize,
    /// Absent or unusable in the provider response.
    pub missing: usize,
    /// Lost their claim before the result could be written.
    pub lost: usize,
}

#[derive(Clone)]
pub struct FetchStage<S, P, Q>
where
    S: WorkStore,
    P: MetadataProvider,
    Q: TaskQueue,
{
    claims: ClaimProtocol<S>,
    provider: P,
    queue: Q,
    config: FetchConfig,
}

impl<S, P, Q> FetchStage<S, P, Q>
where
    S: WorkStore,
    P: MetadataProvider,
    Q: TaskQueue,
{
    pub fn new(claims: ClaimProtocol<S>, provider: P, queue: Q, config: FetchConfig) -> Self {
        Self {
            claims,
            provider,
            queue,
            config,
        }
    }

    pub fn claims(&self) -> &ClaimProtocol<S> {
        &self.claims
    }

    /// Claim the next batch of `queued` items and fetch it. `None` when
    /// there was nothing to claim.
    pub async fn run_next(&self) -> Result<Option<FetchOutcome>, AppError> {
        let claim = self
            .claims
            .claim_batch(WorkStatus::Queued, WorkStatus::Processing)
            .await?;
        if claim.is_empty() {
            return Ok(None);
        }
        self.run(&claim).await.map(Some)
    }

    /// Claim the given ids out of `queued` and fetch whatever was won.
    pub async fn process_ids(&self, ids: &[i64]) -> Result<FetchOutcome, AppError> {
        let claim = self
            .claims
            .claim_ids(ids, WorkStatus::Queued, WorkStatus::Processing)
            .await?;
        if claim.is_empty() {
            tracing::warn!(requested = ids.len(), "Did not find any works to fetch");
            return Ok(FetchOutcome::default());
        }
        self.run(&claim).await
    }

    /// Fetch metadata for a claimed batch.
    ///
    /// A whole-batch provider failure releases the claim back to `queued`
    /// and returns a retryable error. Everything else is settled per item,
    /// each write guarded by the claim. If settling an item fails, that
    /// item and the ones after it are released before the error is
    /// returned.
    pub async fn run(&self, claim: &Claim) -> Result<FetchOutcome, AppError> {
        let mut outcome = FetchOutcome {
            claimed: claim.len(),
            ..Default::default()
        };
        if claim.is_empty() {
            return Ok(outcome);
        }

        let urls: Vec<String> = claim.items.iter().map(|w| w.url.clone()).collect();
        let mut entries = match self.provider.fetch_batch(&urls).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(claim_token = %claim.token, error = %e, "Metadata fetch failed for batch");
                self.claims.release(claim).await?;
                return Err(e.into_batch_failure());
            }
        };

        for (i, work) in claim.items.iter().enumerate() {
            let settled = match entries.remove(&work.url).filter(FileMetadata::is_usable) {
                Some(meta) => self.store_entry(claim, work, meta, &mut outcome).await,
                None => self.handle_missing(claim, work, &mut outcome).await,
            };
            if let Err(e) = settled {
                let rest: Vec<i64> = claim.items[i..].iter().map(|w| w.id).collect();
                tracing::error!(
                    claim_token = %claim.token,
                    work_id = work.id,
                    remaining = rest.len(),
                    error = %e,
                    "Fetch batch aborted, releasing unsettled items"
                );
                if let Err(release_err) = self.claims.release_ids(claim, &rest).await {
                    tracing::error!(claim_token = %claim.token, error = %release_err, "Failed to release unsettled items");
                }
                return Err(e);
            }
        }

        tracing::info!(
            claim_token = %claim.token,
            claimed = outcome.claimed,
            done = outcome.done,
            hash_enqueued = outcome.hash_enqueued,
            missing = outcome.missing,
            "Fetch batch finished"
        );
        Ok(outcome)
    }

    async fn store_entry(
        &self,
        claim: &Claim,
        work: &WorkItem,
        meta: FileMetadata,
        outcome: &mut FetchOutcome,
    ) -> Result<(), AppError> {
        let blob = serde_json::to_value(&meta)?;
        let thumb = meta.thumburl.filter(|_| work.hash_value.is_none());

        let update = match thumb {
            Some(_) => WorkUpdate::new().metadata(blob),
            None => WorkUpdate::new()
                .metadata(blob)
                .status(WorkStatus::Done)
                .clear_claim(),
        };
        let changed = self
            .claims
            .store()
            .conditional_update(&[work.id], claim.guard(), &update)
            .await?;
        if changed == 0 {
            tracing::warn!(work_id = work.id, claim_token = %claim.token, "Lost claim before storing metadata");
            outcome.lost += 1;
            return Ok(());
        }

        match thumb {
            Some(image_url) => {
                let task = Task::ComputeHash {
                    work_id: work.id,
                    image_url,
                    claim_token: claim.token,
                };
                self.queue
                    .enqueue(&task, self.config.hash_max_attempts)
                    .await?;
                outcome.hash_enqueued += 1;
            }
            None => outcome.done += 1,
        }
        Ok(())
    }

    async fn handle_missing(
        &self,
        claim: &Claim,
        work: &WorkItem,
        outcome: &mut FetchOutcome,
    ) -> Result<(), AppError> {
        outcome.missing += 1;
        match self.config.missing_entry {
            MissingEntryPolicy::LeaveClaimed => {
                tracing::warn!(work_id = work.id, url = %work.url, "No usable metadata, leaving claimed");
            }
            MissingEntryPolicy::MarkError => {
                tracing::warn!(work_id = work.id, url = %work.url, "No usable metadata, marking error");
                let update = WorkUpdate::new().status(WorkStatus::Error).clear_claim();
                self.claims
                    .store()
                    .conditional_update(&[work.id], claim.guard(), &update)
                    .await?;
            }
        }
        Ok(())
    }
}
