// src/ingest/types.rs
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry pulled from a feed. Immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub published: Option<DateTime<Utc>>,
    pub summary: String,
    #[serde(rename = "source_feed")]
    pub source_id: String,
    /// Source-provided unique id (`<guid>` / `<id>`), if any.
    pub id: Option<String>,
}

impl FeedItem {
    /// Deduplication key: the source id when present, else the link.
    /// `None` when the entry carries neither.
    pub fn identity(&self) -> Option<&str> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| Some(self.link.trim()).filter(|s| !s.is_empty()))
    }
}

/// Per-source ingestion settings, resolved from the app config.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub url: String,
    pub max_age_hours: Option<f64>,
    /// Per-source item cap. `None` (or 0) means "use the global default".
    pub cap: Option<usize>,
    pub skip: bool,
}

impl SourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_age_hours: None,
            cap: None,
            skip: false,
        }
    }

    pub fn with_max_age_hours(mut self, hours: f64) -> Self {
        self.max_age_hours = Some(hours);
        self
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }

    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    /// Sources are keyed by their URL everywhere (cache, stats, health).
    pub fn source_id(&self) -> &str {
        &self.url
    }
}

/// Conditional-GET validators returned by a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validator {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("unparseable feed: {0}")]
    Parse(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug)]
pub enum FetchResult {
    Success {
        items: Vec<FeedItem>,
        validator: Option<Validator>,
    },
    NotModified,
    Failure(FetchError),
}

/// Fetches a single source. Implementations must not touch the cache.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch(&self, source_url: &str, validator: Option<&Validator>) -> FetchResult;
}
