use std::collections::HashMap;
use std::future::Future;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::metadata::FileMetadata;
use crate::work::{NewWork, UpdateGuard, WorkItem, WorkStatus, WorkUpdate};

/// Durable persistence of work items. No business logic lives here: the
/// claim protocol and the stages compose against these primitives.
pub trait WorkStore: Send + Sync + Clone {
    /// Insert a new `idle` item. Returns `false` when an item with the same
    /// `url` already exists; that is not an error.
    fn insert_if_absent(
        &self,
        work: &NewWork,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Ids of up to `limit` items currently in `status`.
    fn select_batch(
        &self,
        status: WorkStatus,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<i64>, AppError>> + Send;

    /// Apply `update` to every row in `ids` that still satisfies `guard`,
    /// atomically per row. Returns the number of rows actually changed.
    fn conditional_update(
        &self,
        ids: &[i64],
        guard: UpdateGuard,
        update: &WorkUpdate,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn get_by_ids(
        &self,
        ids: &[i64],
    ) -> impl Future<Output = Result<Vec<WorkItem>, AppError>> + Send;

    /// Claimed items in `status` whose claim started before `older_than`.
    fn select_stale(
        &self,
        status: WorkStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<WorkItem>, AppError>> + Send;

    fn count_by_status(
        &self,
        status: WorkStatus,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;
}

/// Remote metadata source for a batch of source identifiers.
pub trait MetadataProvider: Send + Sync + Clone {
    /// Maximum number of identifiers accepted per request.
    fn batch_limit(&self) -> usize {
        50
    }

    /// Fetch metadata for all `urls` in one round trip.
    ///
    /// An `Err` means the whole batch failed. Identifiers the provider did
    /// not describe are simply absent from the map.
    fn fetch_batch(
        &self,
        urls: &[String],
    ) -> impl Future<Output = Result<HashMap<String, FileMetadata>, AppError>> + Send;
}

/// Downloads a raw artifact (thumbnail image) into memory.
pub trait ArtifactFetcher: Send + Sync + Clone {
    fn fetch_bytes(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, AppError>> + Send;
}

/// Computes a perceptual hash of a local image file.
pub trait PerceptualHasher: Send + Sync + Clone {
    fn hash_file(&self, path: &Path) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Downstream bulk loader.
pub trait BulkLoader: Send + Sync + Clone {
    /// Send one batch of serialized documents (one per line) and return
    /// the loader's verdict per identifier.
    fn load(
        &self,
        documents: &[String],
    ) -> impl Future<Output = Result<HashMap<String, String>, AppError>> + Send;
}
