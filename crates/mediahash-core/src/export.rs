//! Export lane: render finished items into loader documents, pipe them to
//! the bulk loader and reconcile its per-identifier verdicts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::claim::{Claim, ClaimProtocol};
use crate::error::AppError;
use crate::metadata::{FileMetadata, strip_markup};
use crate::traits::{BulkLoader, WorkStore};
use crate::work::{Handler, WorkItem, WorkStatus, WorkUpdate};

/// Provenance marker attached to every Commons record.
pub const WMC_COLLECTION: &str = "https://commons.wikimedia.org";

/// Loader status token meaning "accepted".
pub const LOADER_OK: &str = "ok";

/// Typed key/value assertion about a work or one of its media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "propertyName", rename_all = "camelCase")]
pub enum Annotation {
    #[serde(rename_all = "camelCase")]
    Creator { creator_name: String },
    #[serde(rename_all = "camelCase")]
    Copyright { holder_name: String },
    #[serde(rename_all = "camelCase")]
    Title { title_line: String },
    #[serde(rename_all = "camelCase")]
    Identifier { identifier_link: String },
    #[serde(rename_all = "camelCase")]
    Locator { locator_link: String },
    #[serde(rename_all = "camelCase")]
    Policy {
        #[serde(skip_serializing_if = "Option::is_none")]
        statement_link: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        statement_label: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Collection { collection_link: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub annotations: Vec<Annotation>,
}

/// One record in the loader's input stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub annotations: Vec<Annotation>,
    pub media: Vec<Media>,
}

impl ExportDocument {
    /// The identifier the loader reports back on, falling back to the
    /// locator like the loader does.
    pub fn identifier(&self) -> Option<&str> {
        self.annotations
            .iter()
            .find_map(|a| match a {
                Annotation::Identifier { identifier_link } => Some(identifier_link.as_str()),
                _ => None,
            })
            .or_else(|| {
                self.annotations.iter().find_map(|a| match a {
                    Annotation::Locator { locator_link } => Some(locator_link.as_str()),
                    _ => None,
                })
            })
    }
}

impl Handler {
    /// Render a finished work item into a loader document.
    pub fn export_document(&self, work: &WorkItem) -> Result<ExportDocument, AppError> {
        match self {
            Handler::Wmc => wmc_document(work),
        }
    }
}

/// Serialize one work item as a single loader input line.
pub fn document_line(work: &WorkItem) -> Result<(String, String), AppError> {
    let doc = work.handler.export_document(work)?;
    let identifier = doc
        .identifier()
        .ok_or_else(|| AppError::ExportError(format!("work {} has no identifier", work.id)))?
        .to_string();
    Ok((identifier, serde_json::to_string(&doc)?))
}

fn wmc_document(work: &WorkItem) -> Result<ExportDocument, AppError> {
    let blob = work
        .metadata_blob
        .clone()
        .ok_or_else(|| AppError::ExportError(format!("work {} has no metadata", work.id)))?;
    let meta: FileMetadata = serde_json::from_value(blob)?;

    let identifier = meta
        .identifier
        .as_deref()
        .filter(|i| !i.is_empty())
        .ok_or_else(|| AppError::ExportError(format!("work {} has no identifier", work.id)))?;
    Url::parse(identifier).map_err(|e| {
        AppError::ExportError(format!(
            "work {} has unparsable identifier '{identifier}': {e}",
            work.id
        ))
    })?;

    let mut annotations = Vec::new();

    let artist = meta
        .artist
        .as_deref()
        .map(strip_markup)
        .filter(|a| !a.is_empty());
    if let Some(artist) = &artist {
        annotations.push(Annotation::Creator {
            creator_name: artist.clone(),
        });
        if meta.is_copyrighted() {
            annotations.push(Annotation::Copyright {
                holder_name: artist.clone(),
            });
        }
    }

    annotations.push(Annotation::Title {
        title_line: title_from_page(&work.url),
    });
    annotations.push(Annotation::Identifier {
        identifier_link: identifier.to_string(),
    });
    annotations.push(Annotation::Locator {
        locator_link: identifier.to_string(),
    });

    if meta.licenseurl.is_some() || meta.licenseshort.is_some() {
        annotations.push(Annotation::Policy {
            statement_link: meta.licenseurl.clone(),
            statement_label: meta.licenseshort.clone(),
        });
    }

    annotations.push(Annotation::Collection {
        collection_link: WMC_COLLECTION.to_string(),
    });

    let mut media = Vec::new();
    if let Some(original) = meta.url.as_deref() {
        if meta.thumburl.as_deref() != Some(original) {
            media.push(Media {
                annotations: vec![Annotation::Locator {
                    locator_link: original.to_string(),
                }],
            });
        }
    }
    if let Some(thumb) = meta.thumburl.as_deref() {
        let mut thumb_annotations = vec![Annotation::Locator {
            locator_link: thumb.to_string(),
        }];
        if let Some(hash) = work.hash_value.as_deref() {
            thumb_annotations.push(Annotation::Identifier {
                identifier_link: format!("urn:blockhash:{hash}"),
            });
        }
        media.push(Media {
            annotations: thumb_annotations,
        });
    }

    Ok(ExportDocument { annotations, media })
}

/// `File:Sunset over water.jpg` -> `Sunset over water`.
fn title_from_page(page: &str) -> String {
    let name = page.strip_prefix("File:").unwrap_or(page);
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            stem.to_string()
        }
        _ => name.to_string(),
    }
}

/// Per-batch result of the export stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOutcome {
    /// Accepted by the loader (`done_export`).
    pub exported: usize,
    /// Rejected, missing from the loader response, or lost to a loader failure.
    pub rejected: usize,
    /// Could not be rendered at all.
    pub invalid: usize,
}

/// Batch stage for the `processing_export` lane.
#[derive(Clone)]
pub struct ExportStage<S: WorkStore, L: BulkLoader> {
    claims: ClaimProtocol<S>,
    loader: L,
}

impl<S: WorkStore, L: BulkLoader> ExportStage<S, L> {
    pub fn new(claims: ClaimProtocol<S>, loader: L) -> Self {
        Self { claims, loader }
    }

    /// Claim `ids` out of `queued_export` and export whatever was won.
    pub async fn process_ids(&self, ids: &[i64]) -> Result<ExportOutcome, AppError> {
        let claim = self
            .claims
            .claim_ids(ids, WorkStatus::QueuedExport, WorkStatus::ProcessingExport)
            .await?;
        if claim.is_empty() {
            tracing::warn!(requested = ids.len(), "Did not find any works to export");
            return Ok(ExportOutcome::default());
        }
        self.run(&claim).await
    }

    pub async fn run(&self, claim: &Claim) -> Result<ExportOutcome, AppError> {
        let mut outcome = ExportOutcome::default();
        let mut lines = Vec::with_capacity(claim.len());
        let mut by_identifier: HashMap<String, Vec<i64>> = HashMap::new();
        let mut invalid = Vec::new();

        for work in &claim.items {
            match document_line(work) {
                Ok((identifier, line)) => {
                    lines.push(line);
                    by_identifier.entry(identifier).or_default().push(work.id);
                }
                Err(e) => {
                    tracing::warn!(work_id = work.id, error = %e, "Cannot export work");
                    invalid.push(work.id);
                }
            }
        }

        outcome.invalid = self.finish(claim, &invalid, WorkStatus::Error).await? as usize;
        if lines.is_empty() {
            return Ok(outcome);
        }

        let pending: Vec<i64> = by_identifier.values().flatten().copied().collect();
        let statuses = match self.loader.load(&lines).await {
            Ok(statuses) => statuses,
            Err(e) => {
                tracing::error!(error = %e, works = pending.len(), "Bulk loader failed");
                outcome.rejected = self.finish(claim, &pending, WorkStatus::Error).await? as usize;
                return Ok(outcome);
            }
        };

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for (identifier, ids) in &by_identifier {
            match statuses.get(identifier).map(String::as_str) {
                Some(LOADER_OK) => accepted.extend(ids),
                status => {
                    tracing::warn!(%identifier, ?status, "Loader did not accept work");
                    rejected.extend(ids);
                }
            }
        }

        outcome.exported = self
            .finish(claim, &accepted, WorkStatus::DoneExport)
            .await? as usize;
        outcome.rejected = self.finish(claim, &rejected, WorkStatus::Error).await? as usize;

        tracing::info!(
            exported = outcome.exported,
            rejected = outcome.rejected,
            invalid = outcome.invalid,
            "Export batch finished"
        );
        Ok(outcome)
    }

    async fn finish(&self, claim: &Claim, ids: &[i64], status: WorkStatus) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let update = WorkUpdate::new().status(status).clear_claim();
        self.claims
            .store()
            .conditional_update(ids, claim.guard(), &update)
            .await
    }
}
