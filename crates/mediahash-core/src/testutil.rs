//! Test utilities: in-memory store and queue plus mocks of the external
//! collaborators.
//!
//! All fakes use `Arc<Mutex<_>>` for interior mutability so clones share
//! state and tests can assert on recorded calls.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::export::{ExportDocument, LOADER_OK};
use crate::metadata::FileMetadata;
use crate::orchestrator::{CycleEvent, CycleReporter};
use crate::rate_limit::RateLimiter;
use crate::task::{Queue, QueuedTask, Task, TaskStatus};
use crate::task_queue::TaskQueue;
use crate::traits::{ArtifactFetcher, BulkLoader, MetadataProvider, PerceptualHasher, WorkStore};
use crate::work::{Handler, NewWork, UpdateGuard, WorkItem, WorkStatus, WorkUpdate};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn make_work(id: i64, status: WorkStatus) -> WorkItem {
    WorkItem {
        id,
        handler: Handler::Wmc,
        url: format!("File:Example {id}.jpg"),
        status,
        claim_token: None,
        claim_started_at: None,
        metadata_blob: None,
        hash_value: None,
        updated_at: Utc::now(),
    }
}

pub fn make_metadata(id: i64) -> FileMetadata {
    FileMetadata {
        thumburl: Some(format!(
            "https://upload.example/thumb/Example_{id}.jpg/640px-Example_{id}.jpg"
        )),
        url: Some(format!("https://upload.example/Example_{id}.jpg")),
        identifier: Some(format!("https://commons.example/wiki/File:Example_{id}.jpg")),
        sha1: Some(format!("{id:040x}")),
        licenseurl: Some("https://creativecommons.org/licenses/by-sa/4.0".into()),
        licenseshort: Some("CC BY-SA 4.0".into()),
        copyrighted: Some("True".into()),
        artist: Some("<a href=\"/wiki/User:Jane\">Jane</a>".into()),
        description: Some("A <b>test</b> image".into()),
    }
}

// ---------------------------------------------------------------------------
// MemoryWorkStore
// ---------------------------------------------------------------------------

/// Work store backed by an ordered map. Each call holds the lock for its
/// whole body, so conditional updates are atomic like single SQL statements.
#[derive(Clone, Default)]
pub struct MemoryWorkStore {
    items: Arc<Mutex<BTreeMap<i64, WorkItem>>>,
    raced: Arc<Mutex<Option<(i64, WorkStatus)>>>,
}

impl MemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items `1..=n`, all in `status` and unclaimed.
    pub fn with_items(n: i64, status: WorkStatus) -> Self {
        Self::from_items((1..=n).map(|id| make_work(id, status)).collect())
    }

    pub fn from_items(items: Vec<WorkItem>) -> Self {
        Self {
            items: Arc::new(Mutex::new(items.into_iter().map(|w| (w.id, w)).collect())),
            ..Default::default()
        }
    }

    /// Right after the next `select_batch`, move `id` to `status` under a
    /// foreign claim, as a concurrent claimant would.
    pub fn race_next_select(&self, id: i64, status: WorkStatus) {
        *self.raced.lock().unwrap() = Some((id, status));
    }

    pub fn get(&self, id: i64) -> WorkItem {
        self.items.lock().unwrap()[&id].clone()
    }

    pub fn snapshot(&self) -> Vec<WorkItem> {
        self.items.lock().unwrap().values().cloned().collect()
    }

    pub fn count(&self, status: WorkStatus) -> usize {
        self.items
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.status == status)
            .count()
    }

    fn modify(&self, id: i64, f: impl FnOnce(&mut WorkItem)) {
        f(self.items.lock().unwrap().get_mut(&id).unwrap());
    }

    pub fn set_status(&self, id: i64, status: WorkStatus) {
        self.modify(id, |w| w.status = status);
    }

    pub fn set_hash(&self, id: i64, hash: &str) {
        self.modify(id, |w| w.hash_value = Some(hash.to_string()));
    }

    pub fn set_claim(&self, id: i64, token: Uuid) {
        self.modify(id, |w| {
            w.claim_token = Some(token);
            w.claim_started_at = Some(Utc::now());
        });
    }

    pub fn backdate_claim(&self, id: i64, by: TimeDelta) {
        self.modify(id, |w| {
            w.claim_started_at = w.claim_started_at.map(|at| at - by);
        });
    }
}

impl WorkStore for MemoryWorkStore {
    async fn insert_if_absent(&self, work: &NewWork) -> Result<bool, AppError> {
        let mut items = self.items.lock().unwrap();
        if items.values().any(|w| w.url == work.url) {
            return Ok(false);
        }
        let id = items.keys().next_back().copied().unwrap_or(0) + 1;
        let mut item = make_work(id, WorkStatus::Idle);
        item.handler = work.handler;
        item.url = work.url.clone();
        items.insert(id, item);
        Ok(true)
    }

    async fn select_batch(&self, status: WorkStatus, limit: usize) -> Result<Vec<i64>, AppError> {
        // Let concurrent claimants interleave between select and update.
        tokio::task::yield_now().await;
        let mut items = self.items.lock().unwrap();
        let ids: Vec<i64> = items
            .values()
            .filter(|w| w.status == status)
            .take(limit)
            .map(|w| w.id)
            .collect();

        if let Some((id, to)) = self.raced.lock().unwrap().take() {
            if let Some(item) = items.get_mut(&id) {
                item.status = to;
                item.claim_token = Some(Uuid::new_v4());
                item.claim_started_at = Some(Utc::now());
            }
        }
        Ok(ids)
    }

    async fn conditional_update(
        &self,
        ids: &[i64],
        guard: UpdateGuard,
        update: &WorkUpdate,
    ) -> Result<u64, AppError> {
        let mut items = self.items.lock().unwrap();
        let mut changed = 0;
        for id in ids {
            if let Some(item) = items.get_mut(id) {
                if guard.matches(item) {
                    update.apply_to(item);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<WorkItem>, AppError> {
        let items = self.items.lock().unwrap();
        Ok(items
            .values()
            .filter(|w| ids.contains(&w.id))
            .cloned()
            .collect())
    }

    async fn select_stale(
        &self,
        status: WorkStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, AppError> {
        let items = self.items.lock().unwrap();
        Ok(items
            .values()
            .filter(|w| {
                w.status == status
                    && w.claim_token.is_some()
                    && w.claim_started_at.is_some_and(|at| at < older_than)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self, status: WorkStatus) -> Result<i64, AppError> {
        Ok(self.count(status) as i64)
    }
}

// ---------------------------------------------------------------------------
// MemoryTaskQueue
// ---------------------------------------------------------------------------

/// Task queue backed by an in-memory Vec, claimed in insertion order.
#[derive(Clone, Default)]
pub struct MemoryTaskQueue {
    tasks: Arc<Mutex<Vec<QueuedTask>>>,
    released_workers: Arc<Mutex<Vec<String>>>,
    enqueue_budget: Arc<Mutex<Option<usize>>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that accepts `n` enqueues and rejects every one after that.
    pub fn failing_after(n: usize) -> Self {
        Self {
            enqueue_budget: Arc::new(Mutex::new(Some(n))),
            ..Default::default()
        }
    }

    /// Push a task that has already failed `attempts` times.
    pub fn push_with_attempts(&self, task: Task, attempts: u32, max_attempts: u32) {
        let mut queued = new_task(&task, max_attempts);
        queued.attempts = attempts;
        self.tasks.lock().unwrap().push(queued);
    }

    pub fn all(&self) -> Vec<QueuedTask> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn tasks_in(&self, queue: Queue) -> Vec<QueuedTask> {
        self.all().into_iter().filter(|t| t.queue == queue).collect()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.all().iter().filter(|t| t.status == status).count()
    }

    pub fn released_workers(&self) -> Vec<String> {
        self.released_workers.lock().unwrap().clone()
    }

    fn modify(&self, task_id: Uuid, f: impl FnOnce(&mut QueuedTask)) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) {
            f(task);
            task.updated_at = Utc::now();
        }
    }
}

fn new_task(task: &Task, max_attempts: u32) -> QueuedTask {
    let now = Utc::now();
    QueuedTask {
        id: Uuid::new_v4(),
        queue: task.queue(),
        task: task.clone(),
        status: TaskStatus::Pending,
        attempts: 0,
        max_attempts,
        next_run_at: None,
        error_message: None,
        worker_id: None,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
    }
}

impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: &Task, max_attempts: u32) -> Result<QueuedTask, AppError> {
        if let Some(budget) = self.enqueue_budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return Err(AppError::DatabaseError("enqueue rejected".into()));
            }
            *budget -= 1;
        }
        let queued = new_task(task, max_attempts);
        self.tasks.lock().unwrap().push(queued.clone());
        Ok(queued)
    }

    async fn claim_task(
        &self,
        queues: &[Queue],
        worker_id: &str,
    ) -> Result<Option<QueuedTask>, AppError> {
        let now = Utc::now();
        let mut tasks = self.tasks.lock().unwrap();
        let next = tasks.iter_mut().find(|t| {
            t.status == TaskStatus::Pending
                && queues.contains(&t.queue)
                && t.next_run_at.is_none_or(|at| at <= now)
        });
        Ok(next.map(|task| {
            task.status = TaskStatus::Running;
            task.worker_id = Some(worker_id.to_string());
            task.started_at = Some(now);
            task.clone()
        }))
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), AppError> {
        self.modify(task_id, |t| {
            t.status = TaskStatus::Completed;
            t.completed_at = Some(Utc::now());
        });
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        self.modify(task_id, |t| {
            if next_run_at.is_some() {
                t.status = TaskStatus::Pending;
                t.attempts += 1;
                t.next_run_at = next_run_at;
            } else {
                t.status = TaskStatus::Failed;
                t.completed_at = Some(Utc::now());
            }
            t.error_message = Some(error.to_string());
            t.worker_id = None;
        });
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<QueuedTask>, AppError> {
        Ok(self.all().into_iter().find(|t| t.id == task_id))
    }

    async fn release_worker_tasks(&self, worker_id: &str) -> Result<u64, AppError> {
        self.released_workers
            .lock()
            .unwrap()
            .push(worker_id.to_string());

        let mut tasks = self.tasks.lock().unwrap();
        let mut count = 0u64;
        for task in tasks.iter_mut() {
            if task.worker_id.as_deref() == Some(worker_id) && task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                task.worker_id = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<i64, AppError> {
        Ok(self.count(status) as i64)
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// Metadata provider answering from a fixed map. Queued errors are
/// returned first, one per call.
#[derive(Clone, Default)]
pub struct MockProvider {
    entries: Arc<Mutex<HashMap<String, FileMetadata>>>,
    errors: Arc<Mutex<Vec<AppError>>>,
    requests: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MockProvider {
    pub fn with_entries(entries: Vec<(String, FileMetadata)>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries.into_iter().collect())),
            ..Default::default()
        }
    }

    /// Describe the given ids of `store` with [`make_metadata`].
    pub fn describing(store: &MemoryWorkStore, ids: &[i64]) -> Self {
        Self::with_entries(
            ids.iter()
                .map(|&id| (store.get(id).url, make_metadata(id)))
                .collect(),
        )
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_errors(vec![error])
    }

    pub fn with_errors(errors: Vec<AppError>) -> Self {
        Self {
            errors: Arc::new(Mutex::new(errors)),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requested(&self) -> Vec<Vec<String>> {
        self.requests.lock().unwrap().clone()
    }
}

impl MetadataProvider for MockProvider {
    async fn fetch_batch(&self, urls: &[String]) -> Result<HashMap<String, FileMetadata>, AppError> {
        self.requests.lock().unwrap().push(urls.to_vec());

        let mut errors = self.errors.lock().unwrap();
        if !errors.is_empty() {
            return Err(errors.remove(0));
        }

        let entries = self.entries.lock().unwrap();
        Ok(urls
            .iter()
            .filter_map(|url| entries.get(url).map(|meta| (url.clone(), meta.clone())))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// FailingLimiter
// ---------------------------------------------------------------------------

/// Rate limiter whose first acquisition fails; later ones succeed.
#[derive(Clone)]
pub struct FailingLimiter {
    error: Arc<Mutex<Option<AppError>>>,
}

impl FailingLimiter {
    pub fn new(error: AppError) -> Self {
        Self {
            error: Arc::new(Mutex::new(Some(error))),
        }
    }
}

impl RateLimiter for FailingLimiter {
    async fn acquire(&self) -> Result<(), AppError> {
        match self.error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Artifact fetcher returning queued responses, then a default body.
#[derive(Clone)]
pub struct MockFetcher {
    responses: Arc<Mutex<Vec<Result<Vec<u8>, AppError>>>>,
    default: Vec<u8>,
}

impl MockFetcher {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            default: bytes.to_vec(),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            responses: Arc::new(Mutex::new(vec![Err(error)])),
            default: Vec::new(),
        }
    }
}

impl ArtifactFetcher for MockFetcher {
    async fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>, AppError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(self.default.clone())
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockHasher
// ---------------------------------------------------------------------------

/// Hasher returning a fixed hash and recording the files it was given.
#[derive(Clone)]
pub struct MockHasher {
    hash: String,
    error: Arc<Mutex<Option<AppError>>>,
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl MockHasher {
    pub fn new(hash: &str) -> Self {
        Self {
            hash: hash.to_string(),
            error: Arc::new(Mutex::new(None)),
            paths: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            error: Arc::new(Mutex::new(Some(error))),
            ..Self::new("")
        }
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().unwrap().clone()
    }
}

impl PerceptualHasher for MockHasher {
    async fn hash_file(&self, path: &Path) -> Result<String, AppError> {
        assert!(path.exists(), "hasher called with missing file {path:?}");
        self.paths.lock().unwrap().push(path.to_path_buf());
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(self.hash.clone())
    }
}

// ---------------------------------------------------------------------------
// MockLoader
// ---------------------------------------------------------------------------

/// Bulk loader answering from a fixed status map and recording batches.
#[derive(Clone, Default)]
pub struct MockLoader {
    statuses: Arc<Mutex<HashMap<String, String>>>,
    accept_all: bool,
    error: Arc<Mutex<Option<AppError>>>,
    batches: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MockLoader {
    /// Answers `ok` for every document it receives.
    pub fn accept_all() -> Self {
        Self {
            accept_all: true,
            ..Default::default()
        }
    }

    pub fn with_statuses(statuses: &[(&str, &str)]) -> Self {
        Self {
            statuses: Arc::new(Mutex::new(
                statuses
                    .iter()
                    .map(|(id, status)| (id.to_string(), status.to_string()))
                    .collect(),
            )),
            ..Default::default()
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            error: Arc::new(Mutex::new(Some(error))),
            ..Default::default()
        }
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

impl BulkLoader for MockLoader {
    async fn load(&self, documents: &[String]) -> Result<HashMap<String, String>, AppError> {
        self.batches.lock().unwrap().push(documents.to_vec());
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }

        if self.accept_all {
            return documents
                .iter()
                .map(|line| -> Result<(String, String), AppError> {
                    let doc: ExportDocument = serde_json::from_str(line)?;
                    let identifier = doc.identifier().unwrap_or_default().to_string();
                    Ok((identifier, LOADER_OK.to_string()))
                })
                .collect();
        }
        Ok(self.statuses.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records event labels for both the worker and the
/// orchestrator.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events().iter().filter(|e| *e == label).count()
    }

    fn push(&self, label: &str) {
        self.events.lock().unwrap().push(label.to_string());
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        self.push(match event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::Polling => "Polling",
            WorkerEvent::TaskClaimed { .. } => "TaskClaimed",
            WorkerEvent::TaskCompleted { .. } => "TaskCompleted",
            WorkerEvent::TaskFailed { .. } => "TaskFailed",
            WorkerEvent::ShuttingDown { .. } => "ShuttingDown",
            WorkerEvent::Stopped { .. } => "Stopped",
        });
    }
}

impl CycleReporter for MockReporter {
    fn report(&self, event: CycleEvent<'_>) {
        self.push(match event {
            CycleEvent::Started => "Started",
            CycleEvent::CycleFinished { .. } => "CycleFinished",
            CycleEvent::Idle { .. } => "Idle",
            CycleEvent::CycleFailed { .. } => "CycleFailed",
            CycleEvent::RetriesExhausted { .. } => "RetriesExhausted",
            CycleEvent::StaleReleased { .. } => "StaleReleased",
            CycleEvent::Stopped { .. } => "Stopped",
        });
    }
}
