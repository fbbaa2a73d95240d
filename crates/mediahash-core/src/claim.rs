//! Batch claim protocol.
//!
//! A claim moves a bounded set of items from a source status to a target
//! status and tags them with a fresh token. Three steps:
//!
//! 1. select up to `batch_size` ids in the source status;
//! 2. conditional update of exactly those ids, guarded by "still in the
//!    source status and unclaimed" (the compare-and-swap);
//! 3. re-read the ids and keep only rows carrying this token in the target
//!    status. That set, not the step-1 selection, is the claimed batch.
//!
//! Two concurrent claimants can select overlapping ids, but the store
//! applies the guarded update atomically per row, so each row is won by at
//! most one token.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::traits::WorkStore;
use crate::work::{UpdateGuard, WorkItem, WorkStatus, WorkUpdate};

/// Default batch size; matches the metadata provider's per-request limit.
pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct ClaimConfig {
    pub batch_size: usize,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ClaimConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// A batch of items exclusively owned by one processing attempt.
#[derive(Debug, Clone)]
pub struct Claim {
    pub token: Uuid,
    pub from: WorkStatus,
    pub to: WorkStatus,
    pub started_at: DateTime<Utc>,
    pub items: Vec<WorkItem>,
}

impl Claim {
    fn empty(from: WorkStatus, to: WorkStatus) -> Self {
        Self {
            token: Uuid::new_v4(),
            from,
            to,
            started_at: Utc::now(),
            items: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.items.iter().map(|w| w.id).collect()
    }

    /// Guard matching rows still held by this claim.
    pub fn guard(&self) -> UpdateGuard {
        UpdateGuard::held(self.to, self.token)
    }
}

/// Claims, releases and sweeps batches against a [`WorkStore`].
#[derive(Clone)]
pub struct ClaimProtocol<S: WorkStore> {
    store: S,
    config: ClaimConfig,
}

impl<S: WorkStore> ClaimProtocol<S> {
    pub fn new(store: S, config: ClaimConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Claim the next batch of items sitting in `from`.
    ///
    /// An empty claim means there was nothing to do.
    pub async fn claim_batch(&self, from: WorkStatus, to: WorkStatus) -> Result<Claim, AppError> {
        let ids = self.store.select_batch(from, self.config.batch_size).await?;
        if ids.is_empty() {
            return Ok(Claim::empty(from, to));
        }
        self.claim_ids(&ids, from, to).await
    }

    /// Claim a specific set of ids, e.g. the ids carried by a queued task.
    /// Ids no longer in `from` are silently skipped.
    pub async fn claim_ids(
        &self,
        ids: &[i64],
        from: WorkStatus,
        to: WorkStatus,
    ) -> Result<Claim, AppError> {
        let mut claim = Claim::empty(from, to);
        if ids.is_empty() {
            return Ok(claim);
        }

        let update = WorkUpdate::new()
            .status(to)
            .claim(claim.token, claim.started_at);
        let changed = self
            .store
            .conditional_update(ids, UpdateGuard::unclaimed(from), &update)
            .await?;

        if changed == 0 {
            tracing::debug!(requested = ids.len(), %from, "Lost every id to another claimant");
            return Ok(claim);
        }

        let guard = claim.guard();
        claim.items = self
            .store
            .get_by_ids(ids)
            .await?
            .into_iter()
            .filter(|w| guard.matches(w))
            .collect();

        tracing::debug!(
            claim_token = %claim.token,
            requested = ids.len(),
            claimed = claim.items.len(),
            %from,
            %to,
            "Claimed batch"
        );
        Ok(claim)
    }

    /// Give the whole claim back: every row still held by it returns to the
    /// source status with its token cleared.
    pub async fn release(&self, claim: &Claim) -> Result<u64, AppError> {
        self.release_ids(claim, &claim.ids()).await
    }

    /// Give part of a claim back, e.g. the items a batch never got to.
    /// Rows among `ids` no longer held by the claim are left alone.
    pub async fn release_ids(&self, claim: &Claim, ids: &[i64]) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let update = WorkUpdate::new().status(claim.from).clear_claim();
        let released = self
            .store
            .conditional_update(ids, claim.guard(), &update)
            .await?;
        tracing::info!(claim_token = %claim.token, %released, to = %claim.from, "Released claim");
        Ok(released)
    }

    /// Return up to `limit` items stuck in `status` with a claim older than
    /// `older_than` back to `back_to`. Each row is released under its own
    /// token so a claim refreshed in the meantime is left alone.
    pub async fn release_stale(
        &self,
        status: WorkStatus,
        back_to: WorkStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, AppError> {
        if !status.is_claimed() {
            return Err(AppError::InvalidValue(format!(
                "items in '{status}' never carry a claim"
            )));
        }
        let stale = self.store.select_stale(status, older_than, limit).await?;
        let update = WorkUpdate::new().status(back_to).clear_claim();

        let mut released = 0;
        for work in stale {
            let Some(token) = work.claim_token else {
                continue;
            };
            released += self
                .store
                .conditional_update(&[work.id], UpdateGuard::held(status, token), &update)
                .await?;
        }

        if released > 0 {
            tracing::warn!(%released, %status, %back_to, "Released stale claims");
        }
        Ok(released)
    }
}
