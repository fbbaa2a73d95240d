use scraper::Html;
use serde::{Deserialize, Serialize};

/// Provider metadata for one media file, stored verbatim as a work item's
/// `metadata_blob`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Scaled-down rendition; the artifact that gets hashed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumburl: Option<String>,
    /// Original full-size asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Canonical description page; the identifier used by the export lane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licenseurl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licenseshort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copyrighted: Option<String>,
    /// HTML markup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    /// HTML markup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FileMetadata {
    /// An entry is usable by the fetch stage only if it names a thumbnail.
    pub fn is_usable(&self) -> bool {
        self.thumburl.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn is_copyrighted(&self) -> bool {
        self.copyrighted
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case("true"))
    }
}

/// Reduce provider markup to its text content, with entities decoded once
/// and whitespace collapsed.
pub fn strip_markup(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text: String = fragment.root_element().text().collect();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
