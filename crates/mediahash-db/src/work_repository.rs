use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use mediahash_core::error::AppError;
use mediahash_core::traits::WorkStore;
use mediahash_core::work::{ClaimChange, ClaimGuard, NewWork, UpdateGuard, WorkItem, WorkStatus, WorkUpdate};

const WORK_COLUMNS: &str =
    "id, handler, url, status, claim_token, claim_started_at, metadata_blob, hash_value, updated_at";

/// PostgreSQL work store. Every state change is a single conditional
/// `UPDATE`, so concurrent claimants can never both win a row.
#[derive(Clone)]
pub struct WorkRepository {
    pool: Pool<Postgres>,
}

impl WorkRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Up to `limit` items in `status`, oldest id first.
    pub async fn list_by_status(
        &self,
        status: WorkStatus,
        limit: usize,
    ) -> Result<Vec<WorkItem>, AppError> {
        let sql = format!("SELECT {WORK_COLUMNS} FROM works WHERE status = $1 ORDER BY id LIMIT $2");
        let rows = sqlx::query_as::<_, WorkRow>(&sql)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(WorkItem::try_from).collect()
    }
}

#[derive(sqlx::FromRow)]
struct WorkRow {
    id: i64,
    handler: String,
    url: String,
    status: String,
    claim_token: Option<Uuid>,
    claim_started_at: Option<DateTime<Utc>>,
    metadata_blob: Option<serde_json::Value>,
    hash_value: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkRow> for WorkItem {
    type Error = AppError;

    fn try_from(row: WorkRow) -> Result<Self, Self::Error> {
        Ok(WorkItem {
            id: row.id,
            handler: row.handler.parse()?,
            url: row.url,
            status: row.status.parse()?,
            claim_token: row.claim_token,
            claim_started_at: row.claim_started_at,
            metadata_blob: row.metadata_blob,
            hash_value: row.hash_value,
            updated_at: row.updated_at,
        })
    }
}

impl WorkStore for WorkRepository {
    async fn insert_if_absent(&self, work: &NewWork) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO works (handler, url)
            VALUES ($1, $2)
            ON CONFLICT (url) DO NOTHING
            "#,
        )
        .bind(work.handler.as_str())
        .bind(&work.url)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn select_batch(&self, status: WorkStatus, limit: usize) -> Result<Vec<i64>, AppError> {
        let ids: Vec<(i64,)> =
            sqlx::query_as(r#"SELECT id FROM works WHERE status = $1 ORDER BY id LIMIT $2"#)
                .bind(status.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn conditional_update(
        &self,
        ids: &[i64],
        guard: UpdateGuard,
        update: &WorkUpdate,
    ) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let (set_claim, token, claimed_at, clear_claim) = match update.claim {
            Some(ClaimChange::Set { token, at }) => (true, Some(token), Some(at), false),
            Some(ClaimChange::Clear) => (false, None, None, true),
            None => (false, None, None, false),
        };
        let (require_unclaimed, held_by) = match guard.claim {
            ClaimGuard::Any => (false, None),
            ClaimGuard::Unclaimed => (true, None),
            ClaimGuard::Held(token) => (false, Some(token)),
        };

        // hash_value is write-once: an existing hash always wins.
        let result = sqlx::query(
            r#"
            UPDATE works
            SET
                status = COALESCE($3, status),
                claim_token = CASE WHEN $4 THEN $5 WHEN $6 THEN NULL ELSE claim_token END,
                claim_started_at = CASE WHEN $4 THEN $7 ELSE claim_started_at END,
                metadata_blob = COALESCE($8, metadata_blob),
                hash_value = COALESCE(hash_value, $9),
                updated_at = NOW()
            WHERE id = ANY($1)
              AND status = $2
              AND (NOT $10 OR claim_token IS NULL)
              AND ($11::uuid IS NULL OR claim_token = $11)
            "#,
        )
        .bind(ids)
        .bind(guard.status.as_str())
        .bind(update.status.map(|s| s.as_str()))
        .bind(set_claim)
        .bind(token)
        .bind(clear_claim)
        .bind(claimed_at)
        .bind(&update.metadata_blob)
        .bind(&update.hash_value)
        .bind(require_unclaimed)
        .bind(held_by)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<WorkItem>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {WORK_COLUMNS} FROM works WHERE id = ANY($1) ORDER BY id");
        let rows = sqlx::query_as::<_, WorkRow>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(WorkItem::try_from).collect()
    }

    async fn select_stale(
        &self,
        status: WorkStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, AppError> {
        let sql = format!(
            r#"
            SELECT {WORK_COLUMNS} FROM works
            WHERE status = $1
              AND claim_token IS NOT NULL
              AND claim_started_at < $2
            ORDER BY claim_started_at ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query_as::<_, WorkRow>(&sql)
            .bind(status.as_str())
            .bind(older_than)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(WorkItem::try_from).collect()
    }

    async fn count_by_status(&self, status: WorkStatus) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM works WHERE status = $1"#)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count)
    }
}
