use std::time::Duration;

use mediahash_core::error::AppError;
use mediahash_core::traits::ArtifactFetcher;
use reqwest::Client;

use crate::commons::DEFAULT_USER_AGENT;
use crate::map_send_error;

/// Largest artifact accepted, so a bad URL cannot fill the temp dir.
pub const DEFAULT_MAX_BYTES: usize = 32 * 1024 * 1024;

/// Downloads thumbnails into memory with reqwest.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout_secs: u64,
    max_bytes: usize,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(DEFAULT_USER_AGENT, Duration::from_secs(30))
    }

    pub fn with_timeout(user_agent: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            max_bytes: DEFAULT_MAX_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

impl ArtifactFetcher for ReqwestFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, AppError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }
        if response
            .content_length()
            .is_some_and(|len| len > self.max_bytes as u64)
        {
            return Err(AppError::HttpError(format!(
                "Artifact at {url} exceeds {} bytes",
                self.max_bytes
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read response body: {e}")))?;
        if bytes.len() > self.max_bytes {
            return Err(AppError::HttpError(format!(
                "Artifact at {url} exceeds {} bytes",
                self.max_bytes
            )));
        }
        Ok(bytes.to_vec())
    }
}
