//! URL map, citation records, and online-validation artifacts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const URL_MAP_SCHEMA: &str = "url_map.v1";
pub const CITATION_SCHEMA: &str = "citation.v1";
pub const ONLINE_FIXTURES_SCHEMA: &str = "online_fixtures.v1";
pub const BLOCKED_URLS_SCHEMA: &str = "blocked_urls.v1";

/// Classification of a validated URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationStatus {
    Valid,
    Invalid,
    Blocked,
}

/// Where a URL was first seen. `found_by` lists are capped at 20
/// entries and sorted by `(file, perspective_id, source_line)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FoundBy {
    pub file: String,
    pub perspective_id: String,
    pub source_line: u32,
    pub wave: u8,
    pub ordinal: u32,
}

/// `citations/found-by.json`: raw occurrence map keyed by original URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundByDoc {
    pub schema_version: String,
    pub occurrences: BTreeMap<String, Vec<FoundBy>>,
}

/// One row of `citations/url-map.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlMapEntry {
    /// Stable citation id within the run (`c-0001`, …).
    pub cid: String,
    pub normalized_url: String,
    /// Original spelling as first encountered.
    pub url_original: String,
}

/// `citations/url-map.json` (schema `url_map.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlMap {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    /// Sorted by `normalized_url`.
    pub entries: Vec<UrlMapEntry>,
}

impl UrlMap {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != URL_MAP_SCHEMA {
            return Err(CoreError::schema(format!(
                "url map schema_version {:?}, expected {URL_MAP_SCHEMA:?}",
                self.schema_version
            )));
        }
        let mut prev: Option<&str> = None;
        for entry in &self.entries {
            if let Some(p) = prev {
                if entry.normalized_url.as_str() <= p {
                    return Err(CoreError::schema(
                        "url map entries must be strictly sorted by normalized_url",
                    ));
                }
            }
            prev = Some(entry.normalized_url.as_str());
        }
        Ok(())
    }

    pub fn cid_for(&self, normalized_url: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.normalized_url == normalized_url)
            .map(|e| e.cid.as_str())
    }
}

/// One line of `citations/citations.jsonl` (schema `citation.v1`).
///
/// At most one record per `normalized_url`; the file is sorted by
/// `(normalized_url, url_original)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationRecord {
    pub cid: String,
    pub normalized_url: String,
    /// Userinfo-stripped display URL.
    pub url: String,
    pub url_original: String,
    pub status: CitationStatus,
    pub checked_at: DateTime<Utc>,
    #[serde(default)]
    pub found_by: Vec<FoundBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_snippet: Option<String>,
    #[serde(default)]
    pub notes: String,
}

/// A URL the ladder classified as blocked, awaiting operator action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedUrl {
    pub cid: String,
    pub normalized_url: String,
    pub reason: String,
    /// Explicit operator disposition; absent until triaged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// `citations/blocked-urls.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedUrlsDoc {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub blocked: Vec<BlockedUrl>,
}

/// Recorded outcome for one URL, replayable deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineOutcome {
    pub status: CitationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default)]
    pub notes: String,
}

/// `citations/online-fixtures.<ts>.json` and the `.latest.json` pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineFixtures {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    /// Keyed by normalized URL.
    pub outcomes: BTreeMap<String, OnlineOutcome>,
}

impl OnlineFixtures {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            schema_version: ONLINE_FIXTURES_SCHEMA.to_string(),
            generated_at: now,
            outcomes: BTreeMap::new(),
        }
    }
}
