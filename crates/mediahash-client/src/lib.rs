pub mod blockhash;
pub mod commons;
pub mod downloader;
pub mod loader;

mod command;

pub use blockhash::CommandHasher;
pub use commons::CommonsClient;
pub use downloader::ReqwestFetcher;
pub use loader::CommandLoader;

use mediahash_core::error::AppError;

/// Classify a reqwest send error the way the task worker expects:
/// timeouts and connection failures are retryable.
pub(crate) fn map_send_error(e: reqwest::Error, timeout_secs: u64) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout_secs)
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::HttpError(e.to_string())
    }
}
