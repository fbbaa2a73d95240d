use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Pipeline state of a work item.
///
/// ```text
/// idle -> queued -> processing -> {done, error}
/// done -> queued_export -> processing_export -> {done_export, error}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Idle,
    Queued,
    Processing,
    Done,
    QueuedExport,
    ProcessingExport,
    DoneExport,
    Error,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 8] = [
        WorkStatus::Idle,
        WorkStatus::Queued,
        WorkStatus::Processing,
        WorkStatus::Done,
        WorkStatus::QueuedExport,
        WorkStatus::ProcessingExport,
        WorkStatus::DoneExport,
        WorkStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Idle => "idle",
            WorkStatus::Queued => "queued",
            WorkStatus::Processing => "processing",
            WorkStatus::Done => "done",
            WorkStatus::QueuedExport => "queued_export",
            WorkStatus::ProcessingExport => "processing_export",
            WorkStatus::DoneExport => "done_export",
            WorkStatus::Error => "error",
        }
    }

    /// No automated transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Error | WorkStatus::DoneExport)
    }

    /// Statuses in which an item is expected to carry a claim token.
    pub fn is_claimed(&self) -> bool {
        matches!(self, WorkStatus::Processing | WorkStatus::ProcessingExport)
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| AppError::InvalidValue(format!("Unknown work status: {s}")))
    }
}

/// Provider integration that owns a work item.
///
/// Dispatch for fetch and export goes through this closed set rather than
/// through free-form strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handler {
    /// Wikimedia Commons.
    Wmc,
}

impl Handler {
    pub fn as_str(&self) -> &'static str {
        match self {
            Handler::Wmc => "wmc",
        }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Handler {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wmc" => Ok(Handler::Wmc),
            _ => Err(AppError::InvalidValue(format!("Unknown work handler: {s}"))),
        }
    }
}

/// A single media file moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub handler: Handler,
    /// Canonical source identifier (for Commons, the `File:` page title).
    pub url: String,
    pub status: WorkStatus,
    pub claim_token: Option<Uuid>,
    pub claim_started_at: Option<DateTime<Utc>>,
    pub metadata_blob: Option<serde_json::Value>,
    pub hash_value: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Row to insert via the seeding path.
#[derive(Debug, Clone)]
pub struct NewWork {
    pub handler: Handler,
    pub url: String,
}

impl NewWork {
    pub fn new(handler: Handler, url: impl Into<String>) -> Self {
        Self {
            handler,
            url: url.into(),
        }
    }
}

/// Precondition on a row's claim token for a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimGuard {
    /// Do not look at the claim token.
    Any,
    /// The row must not be claimed.
    Unclaimed,
    /// The row must be held by this token.
    Held(Uuid),
}

/// Compare-and-swap precondition: the row must be in `status` and satisfy
/// the claim guard, otherwise it is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateGuard {
    pub status: WorkStatus,
    pub claim: ClaimGuard,
}

impl UpdateGuard {
    pub fn status(status: WorkStatus) -> Self {
        Self {
            status,
            claim: ClaimGuard::Any,
        }
    }

    pub fn unclaimed(status: WorkStatus) -> Self {
        Self {
            status,
            claim: ClaimGuard::Unclaimed,
        }
    }

    pub fn held(status: WorkStatus, token: Uuid) -> Self {
        Self {
            status,
            claim: ClaimGuard::Held(token),
        }
    }

    /// Whether `item` satisfies this guard.
    pub fn matches(&self, item: &WorkItem) -> bool {
        if item.status != self.status {
            return false;
        }
        match self.claim {
            ClaimGuard::Any => true,
            ClaimGuard::Unclaimed => item.claim_token.is_none(),
            ClaimGuard::Held(token) => item.claim_token == Some(token),
        }
    }
}

/// How a conditional update changes the claim columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimChange {
    Set { token: Uuid, at: DateTime<Utc> },
    Clear,
}

/// Field changes applied by a conditional update. `None` leaves a column as is.
///
/// `hash_value` is write-once: stores only fill it when it is still null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkUpdate {
    pub status: Option<WorkStatus>,
    pub claim: Option<ClaimChange>,
    pub metadata_blob: Option<serde_json::Value>,
    pub hash_value: Option<String>,
}

impl WorkUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: WorkStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn claim(mut self, token: Uuid, at: DateTime<Utc>) -> Self {
        self.claim = Some(ClaimChange::Set { token, at });
        self
    }

    pub fn clear_claim(mut self) -> Self {
        self.claim = Some(ClaimChange::Clear);
        self
    }

    pub fn metadata(mut self, blob: serde_json::Value) -> Self {
        self.metadata_blob = Some(blob);
        self
    }

    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash_value = Some(hash.into());
        self
    }

    /// Apply this update to an in-memory item, with the same column
    /// semantics the SQL store uses.
    pub fn apply_to(&self, item: &mut WorkItem) {
        if let Some(status) = self.status {
            item.status = status;
        }
        match self.claim {
            Some(ClaimChange::Set { token, at }) => {
                item.claim_token = Some(token);
                item.claim_started_at = Some(at);
            }
            Some(ClaimChange::Clear) => {
                item.claim_token = None;
            }
            None => {}
        }
        if let Some(blob) = &self.metadata_blob {
            item.metadata_blob = Some(blob.clone());
        }
        if item.hash_value.is_none() {
            if let Some(hash) = &self.hash_value {
                item.hash_value = Some(hash.clone());
            }
        }
        item.updated_at = Utc::now();
    }
}
