use thiserror::Error;

/// Application-wide error types for mediahash.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed (metadata API or artifact host).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Metadata provider returned something that could not be parsed
    /// for the batch as a whole.
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// An external command (hasher, bulk loader) failed or produced
    /// unusable output.
    #[error("Command error: {0}")]
    CommandError(String),

    /// An export document could not be built for a work item.
    #[error("Export error: {0}")]
    ExportError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Local I/O failed (temp buffers, seed files).
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A status, handler or queue string did not match a known value.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is a transient transport or provider
    /// failure worth retrying at the task level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::HttpError(_)
                | AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::ProviderError(_)
        )
    }

    /// Classify a failure of a whole provider batch. Such failures are
    /// always retried, so anything not already retryable becomes a
    /// [`AppError::ProviderError`].
    pub fn into_batch_failure(self) -> AppError {
        if self.is_retryable() {
            self
        } else {
            AppError::ProviderError(self.to_string())
        }
    }
}
