//! Global token bucket shared by every worker process through the work
//! store. Refill is computed from the database clock inside one atomic
//! `UPDATE`, so workers on different hosts never disagree on time.

use std::time::Duration;

use sqlx::{PgPool, Pool, Postgres};

use mediahash_core::error::AppError;
use mediahash_core::rate_limit::{RateLimit, RateLimiter};

/// Upper bound on a single sleep, so a re-tuned limit is picked up quickly.
const MAX_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct PgRateLimiter {
    pool: Pool<Postgres>,
    name: String,
    limit: RateLimit,
}

impl PgRateLimiter {
    /// Create the bucket `name` if missing, or update its rate if it exists.
    /// Tokens already in the bucket are kept.
    pub async fn register(pool: PgPool, name: &str, limit: RateLimit) -> Result<Self, AppError> {
        sqlx::query(
            r#"
            INSERT INTO rate_limits (name, tokens, capacity, refill_per_sec)
            VALUES ($1, 1, 1, $2)
            ON CONFLICT (name) DO UPDATE
            SET refill_per_sec = EXCLUDED.refill_per_sec
            "#,
        )
        .bind(name)
        .bind(limit.refill_per_sec())
        .execute(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(%name, %limit, "Registered global rate limit");
        Ok(Self {
            pool,
            name: name.to_string(),
            limit,
        })
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Take a permit if one is available, otherwise report how long until
    /// the next one.
    async fn try_take(&self) -> Result<Result<(), Duration>, AppError> {
        let taken: Option<(f64,)> = sqlx::query_as(
            r#"
            WITH clock AS (SELECT clock_timestamp() AS now)
            UPDATE rate_limits r
            SET tokens = LEAST(
                    r.capacity,
                    r.tokens + GREATEST(0, EXTRACT(EPOCH FROM (clock.now - r.updated_at))::float8) * r.refill_per_sec
                ) - 1,
                updated_at = GREATEST(clock.now, r.updated_at)
            FROM clock
            WHERE r.name = $1
              AND LEAST(
                    r.capacity,
                    r.tokens + GREATEST(0, EXTRACT(EPOCH FROM (clock.now - r.updated_at))::float8) * r.refill_per_sec
                ) >= 1
            RETURNING r.tokens
            "#,
        )
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if taken.is_some() {
            return Ok(Ok(()));
        }

        let state: Option<(f64, f64)> = sqlx::query_as(
            r#"
            SELECT
                LEAST(
                    capacity,
                    tokens + GREATEST(0, EXTRACT(EPOCH FROM (clock_timestamp() - updated_at))::float8) * refill_per_sec
                ),
                refill_per_sec
            FROM rate_limits
            WHERE name = $1
            "#,
        )
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let (tokens, refill_per_sec) = state.ok_or_else(|| {
            AppError::ConfigError(format!("Rate limit '{}' is not registered", self.name))
        })?;
        Ok(Err(wait_for_permit(tokens, refill_per_sec)))
    }
}

fn wait_for_permit(tokens: f64, refill_per_sec: f64) -> Duration {
    if refill_per_sec <= 0.0 {
        return MAX_WAIT;
    }
    let missing = (1.0 - tokens).max(0.0);
    Duration::from_secs_f64(missing / refill_per_sec)
        .clamp(Duration::from_millis(1), MAX_WAIT)
}

impl RateLimiter for PgRateLimiter {
    async fn acquire(&self) -> Result<(), AppError> {
        loop {
            match self.try_take().await? {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    tracing::debug!(limiter = %self.name, wait_ms = %wait.as_millis(), "Rate limited");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
