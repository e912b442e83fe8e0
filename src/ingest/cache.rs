// src/ingest/cache.rs
//! Short-lived, per-process cache of the last fetch of each source.
//!
//! Purely an optimization: a miss only costs a redundant fetch. The map is
//! locked around get/put and never across a network await.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::ingest::types::{FeedItem, Validator};

pub const DEFAULT_FRESHNESS_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub items: Vec<FeedItem>,
    pub validator: Option<Validator>,
}

#[derive(Debug)]
pub struct FeedCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    freshness: Duration,
}

impl Default for FeedCache {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_FRESHNESS_SECS))
    }
}

impl FeedCache {
    /// Negative windows are treated as zero (cache never fresh).
    pub fn new(freshness: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            freshness: freshness.max(Duration::zero()),
        }
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Fresh entry only: `None` when absent or `now - fetched_at >= freshness`.
    pub fn get(&self, source_id: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let entries = self.entries.lock();
        entries
            .get(source_id)
            .filter(|e| now.signed_duration_since(e.fetched_at) < self.freshness)
            .cloned()
    }

    /// Entry regardless of age; used for its validator and for `NotModified`.
    pub fn stale(&self, source_id: &str) -> Option<CacheEntry> {
        self.entries.lock().get(source_id).cloned()
    }

    pub fn put(&self, source_id: &str, entry: CacheEntry) {
        self.entries.lock().insert(source_id.to_string(), entry);
    }

    pub fn invalidate(&self, source_id: &str) {
        self.entries.lock().remove(source_id);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
