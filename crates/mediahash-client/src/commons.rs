use std::collections::HashMap;
use std::time::Duration;

use mediahash_core::error::AppError;
use mediahash_core::metadata::FileMetadata;
use mediahash_core::traits::MetadataProvider;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::map_send_error;

pub const DEFAULT_API_URL: &str = "https://commons.wikimedia.org/w/api.php";
pub const DEFAULT_USER_AGENT: &str = "mediahash/0.3 (perceptual hash pipeline)";

/// Titles per request accepted by the MediaWiki query API.
pub const COMMONS_BATCH_LIMIT: usize = 50;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const THUMB_WIDTH: &str = "640";
/// Back off when replication lag exceeds this many seconds.
const MAX_LAG: &str = "5";

/// Wikimedia Commons metadata client.
///
/// One `action=query&prop=imageinfo` request per batch of `File:` titles,
/// returning thumbnail, original and description page URLs, the SHA-1 and
/// the license/author fields from `extmetadata`.
#[derive(Clone)]
pub struct CommonsClient {
    client: Client,
    api_url: Url,
    user_agent: String,
    timeout_secs: u64,
}

impl CommonsClient {
    pub fn new() -> Result<Self, AppError> {
        Self::build(DEFAULT_API_URL, DEFAULT_USER_AGENT, DEFAULT_TIMEOUT)
    }

    pub fn with_api_url(api_url: &str, user_agent: &str) -> Result<Self, AppError> {
        Self::build(api_url, user_agent, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(self.api_url.as_str(), &self.user_agent, timeout)
    }

    fn build(api_url: &str, user_agent: &str, timeout: Duration) -> Result<Self, AppError> {
        let api_url = Url::parse(api_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid API URL '{api_url}': {e}")))?;
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            user_agent: user_agent.to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }

    fn request_url(&self, titles: &[String]) -> Result<Url, AppError> {
        Url::parse_with_params(
            self.api_url.as_str(),
            &[
                ("action", "query"),
                ("format", "json"),
                ("formatversion", "2"),
                ("prop", "imageinfo"),
                ("iiprop", "sha1|url|extmetadata"),
                ("iiurlwidth", THUMB_WIDTH),
                ("iilimit", "1"),
                ("maxlag", MAX_LAG),
                ("titles", titles.join("|").as_str()),
            ],
        )
        .map_err(|e| AppError::ConfigError(format!("Invalid API URL: {e}")))
    }

    async fn fetch_chunk(&self, titles: &[String]) -> Result<HashMap<String, FileMetadata>, AppError> {
        let url = self.request_url(titles)?;
        tracing::debug!(titles = titles.len(), "Requesting imageinfo");

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
                self.api_url
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read response body: {e}")))?;
        parse_response(titles, &body)
    }
}

impl MetadataProvider for CommonsClient {
    fn batch_limit(&self) -> usize {
        COMMONS_BATCH_LIMIT
    }

    async fn fetch_batch(&self, urls: &[String]) -> Result<HashMap<String, FileMetadata>, AppError> {
        let mut entries = HashMap::with_capacity(urls.len());
        for chunk in urls.chunks(COMMONS_BATCH_LIMIT) {
            entries.extend(self.fetch_chunk(chunk).await?);
        }
        Ok(entries)
    }
}

// ---- MediaWiki API types ----

#[derive(Deserialize)]
struct ApiResponse {
    query: Option<Query>,
    error: Option<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    code: String,
    #[serde(default)]
    info: String,
}

#[derive(Deserialize)]
struct Query {
    #[serde(default)]
    normalized: Vec<Normalized>,
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Deserialize)]
struct Normalized {
    from: String,
    to: String,
}

#[derive(Deserialize)]
struct Page {
    title: String,
    #[serde(default)]
    imageinfo: Vec<ImageInfo>,
}

#[derive(Deserialize)]
struct ImageInfo {
    thumburl: Option<String>,
    url: Option<String>,
    descriptionurl: Option<String>,
    sha1: Option<String>,
    #[serde(default)]
    extmetadata: HashMap<String, ExtValue>,
}

#[derive(Deserialize)]
struct ExtValue {
    value: serde_json::Value,
}

impl ImageInfo {
    fn ext(&self, key: &str) -> Option<String> {
        self.extmetadata.get(key).map(|v| match &v.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    fn into_metadata(self) -> FileMetadata {
        FileMetadata {
            licenseurl: self.ext("LicenseUrl"),
            licenseshort: self.ext("LicenseShortName"),
            copyrighted: self.ext("Copyrighted"),
            artist: self.ext("Artist"),
            description: self.ext("ImageDescription"),
            thumburl: self.thumburl,
            url: self.url,
            identifier: self.descriptionurl,
            sha1: self.sha1,
        }
    }
}

/// Map an API response back onto the requested titles. Titles the API did
/// not describe are left out; a body that is not an API response at all
/// fails the whole batch.
fn parse_response(titles: &[String], body: &str) -> Result<HashMap<String, FileMetadata>, AppError> {
    let response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| AppError::ProviderError(format!("Unparsable API response: {e}")))?;

    if let Some(error) = response.error {
        return Err(AppError::ProviderError(format!(
            "API error {}: {}",
            error.code, error.info
        )));
    }
    let query = response
        .query
        .ok_or_else(|| AppError::ProviderError("API response has no query".into()))?;

    let normalized: HashMap<&str, &str> = query
        .normalized
        .iter()
        .map(|n| (n.from.as_str(), n.to.as_str()))
        .collect();
    let mut pages: HashMap<String, Page> = query
        .pages
        .into_iter()
        .map(|p| (p.title.clone(), p))
        .collect();

    let mut entries = HashMap::new();
    for title in titles {
        let canonical = normalized.get(title.as_str()).copied().unwrap_or(title.as_str());
        let Some(info) = pages
            .remove(canonical)
            .and_then(|p| p.imageinfo.into_iter().next())
        else {
            tracing::warn!(%title, "No imageinfo returned");
            continue;
        };
        entries.insert(title.clone(), info.into_metadata());
    }
    Ok(entries)
}
