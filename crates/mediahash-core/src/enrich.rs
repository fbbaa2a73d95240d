//! Rate-limited enrichment stage: perceptual hash of one item's thumbnail.
//!
//! Runs once per item, outside any batch. Each invocation takes a permit
//! from the shared limiter before touching the artifact host. Download and
//! hashing failures are terminal for the item; there is no retry.

use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::error::AppError;
use crate::rate_limit::RateLimiter;
use crate::traits::{ArtifactFetcher, PerceptualHasher, WorkStore};
use crate::work::{UpdateGuard, WorkStatus, WorkUpdate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOutcome {
    /// Hash computed and stored, item is `done`.
    Hashed(String),
    /// A hash was already present; the item was only moved to `done`.
    AlreadyHashed,
    /// Rate limiter, download, hasher or the final write failed; the item
    /// is `error`.
    Failed,
    /// The item is no longer held by the fetch claim that scheduled this
    /// task. Nothing was written.
    Skipped,
}

#[derive(Clone)]
pub struct HashStage<S, R, F, H>
where
    S: WorkStore,
    R: RateLimiter,
    F: ArtifactFetcher,
    H: PerceptualHasher,
{
    store: S,
    limiter: R,
    fetcher: F,
    hasher: H,
}

impl<S, R, F, H> HashStage<S, R, F, H>
where
    S: WorkStore,
    R: RateLimiter,
    F: ArtifactFetcher,
    H: PerceptualHasher,
{
    pub fn new(store: S, limiter: R, fetcher: F, hasher: H) -> Self {
        Self {
            store,
            limiter,
            fetcher,
            hasher,
        }
    }

    /// Hash the thumbnail of `work_id`, provided it is still held by
    /// `claim_token` in `processing`.
    pub async fn run(
        &self,
        work_id: i64,
        image_url: &str,
        claim_token: Uuid,
    ) -> Result<HashOutcome, AppError> {
        let guard = UpdateGuard::held(WorkStatus::Processing, claim_token);
        let Some(work) = self
            .store
            .get_by_ids(&[work_id])
            .await?
            .into_iter()
            .find(|w| guard.matches(w))
        else {
            tracing::info!(work_id, %claim_token, "Work no longer held by this claim, skipping hash");
            return Ok(HashOutcome::Skipped);
        };

        if work.hash_value.is_some() {
            let update = WorkUpdate::new().status(WorkStatus::Done).clear_claim();
            self.store.conditional_update(&[work_id], guard, &update).await?;
            return Ok(HashOutcome::AlreadyHashed);
        }

        if let Err(e) = self.limiter.acquire().await {
            return self.fail(work_id, guard, "rate limit", &e).await;
        }

        let bytes = match self.fetcher.fetch_bytes(image_url).await {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(work_id, guard, "download", &e).await,
        };

        // Dropping the buffer deletes the file, on every path out of here.
        let buffer = match write_buffer(image_url, &bytes).await {
            Ok(buffer) => buffer,
            Err(e) => return self.fail(work_id, guard, "buffer", &e).await,
        };

        let hash = match self.hasher.hash_file(buffer.path()).await {
            Ok(hash) if !hash.trim().is_empty() => hash.trim().to_string(),
            Ok(_) => {
                let e = AppError::CommandError("hasher produced no output".into());
                return self.fail(work_id, guard, "hash", &e).await;
            }
            Err(e) => return self.fail(work_id, guard, "hash", &e).await,
        };
        drop(buffer);

        let update = WorkUpdate::new()
            .hash(hash.clone())
            .status(WorkStatus::Done)
            .clear_claim();
        let changed = match self.store.conditional_update(&[work_id], guard, &update).await {
            Ok(changed) => changed,
            Err(e) => return self.fail(work_id, guard, "store", &e).await,
        };
        if changed == 0 {
            tracing::warn!(work_id, %claim_token, "Lost claim before storing hash");
            return Ok(HashOutcome::Skipped);
        }

        tracing::info!(work_id, %hash, "Stored hash");
        Ok(HashOutcome::Hashed(hash))
    }

    async fn fail(
        &self,
        work_id: i64,
        guard: UpdateGuard,
        step: &str,
        error: &AppError,
    ) -> Result<HashOutcome, AppError> {
        tracing::warn!(work_id, %step, %error, "Hashing failed, marking error");
        let update = WorkUpdate::new().status(WorkStatus::Error).clear_claim();
        self.store.conditional_update(&[work_id], guard, &update).await?;
        Ok(HashOutcome::Failed)
    }
}

async fn write_buffer(image_url: &str, bytes: &[u8]) -> Result<NamedTempFile, AppError> {
    let suffix = extension(image_url).map(|ext| format!(".{ext}"));
    let mut builder = tempfile::Builder::new();
    builder.prefix("mediahash-");
    if let Some(suffix) = &suffix {
        builder.suffix(suffix);
    }
    let buffer = builder.tempfile()?;
    tokio::fs::write(buffer.path(), bytes).await?;
    Ok(buffer)
}

/// Image extension of the URL's last path segment, so the hasher can
/// sniff the format from the file name.
fn extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then_some(ext)
}
