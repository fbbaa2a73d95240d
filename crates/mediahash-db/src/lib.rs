pub mod config;
pub mod database;
pub mod rate_limiter;
pub mod task_repository;
pub mod work_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use rate_limiter::PgRateLimiter;
pub use task_repository::TaskRepository;
pub use work_repository::WorkRepository;
