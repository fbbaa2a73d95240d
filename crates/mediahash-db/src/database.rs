use mediahash_core::AppError;
use mediahash_core::RateLimit;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::rate_limiter::PgRateLimiter;
use crate::task_repository::TaskRepository;
use crate::work_repository::WorkRepository;

/// Owns the connection pool, runs migrations and hands out the
/// store-backed collaborators of the pipeline.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::debug!(max_connections = config.max_connections, "Connected to work store");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by the integration tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn work_repo(&self) -> WorkRepository {
        WorkRepository::new(self.pool.clone())
    }

    pub fn task_repo(&self) -> TaskRepository {
        TaskRepository::new(self.pool.clone())
    }

    /// Register (or re-tune) the named global limiter and return a handle to it.
    pub async fn rate_limiter(&self, name: &str, limit: RateLimit) -> Result<PgRateLimiter, AppError> {
        PgRateLimiter::register(self.pool.clone(), name, limit).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
