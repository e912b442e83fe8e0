// src/ingest/filter.rs
//! Per-source item filter: recency → keywords → sort → cap.
//!
//! The order is fixed; the cap must see the sorted list so that it keeps the
//! N most recent items rather than the first N the source happened to list.

use chrono::{DateTime, Duration, Utc};

use crate::ingest::types::{FeedItem, SourceConfig};

pub const DEFAULT_ITEM_CAP: usize = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOutcome {
    pub items: Vec<FeedItem>,
    pub dropped_by_age: usize,
    pub dropped_by_keyword: usize,
    pub dropped_by_cap: usize,
}

impl FilterOutcome {
    pub fn dropped(&self) -> usize {
        self.dropped_by_age + self.dropped_by_keyword + self.dropped_by_cap
    }
}

#[derive(Debug, Clone)]
pub struct ItemFilter {
    /// Lowercased, non-empty keywords.
    keywords: Vec<String>,
    default_cap: usize,
}

impl Default for ItemFilter {
    fn default() -> Self {
        Self::new(Vec::<String>::new(), DEFAULT_ITEM_CAP)
    }
}

impl ItemFilter {
    /// A `default_cap` of 0 falls back to [`DEFAULT_ITEM_CAP`].
    pub fn new<S: AsRef<str>>(keywords: impl IntoIterator<Item = S>, default_cap: usize) -> Self {
        let keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        let default_cap = if default_cap == 0 {
            DEFAULT_ITEM_CAP
        } else {
            default_cap
        };
        Self {
            keywords,
            default_cap,
        }
    }

    pub fn default_cap(&self) -> usize {
        self.default_cap
    }

    pub fn cap_for(&self, source: &SourceConfig) -> usize {
        match source.cap {
            Some(n) if n > 0 => n,
            _ => self.default_cap,
        }
    }

    pub fn apply(
        &self,
        raw_items: Vec<FeedItem>,
        source: &SourceConfig,
        now: DateTime<Utc>,
    ) -> FilterOutcome {
        let mut out = FilterOutcome::default();

        // 1) Recency. Undated items always survive.
        let mut items = match cutoff(source.max_age_hours, now) {
            Some(cutoff) => {
                let before = raw_items.len();
                let kept: Vec<FeedItem> = raw_items
                    .into_iter()
                    .filter(|it| it.published.map_or(true, |p| p >= cutoff))
                    .collect();
                out.dropped_by_age = before - kept.len();
                kept
            }
            None => raw_items,
        };

        // 2) Keywords
        if !self.keywords.is_empty() {
            let before = items.len();
            items.retain(|it| self.matches_keywords(it));
            out.dropped_by_keyword = before - items.len();
        }

        // 3) Newest first; `None < Some(_)` so undated items sink to the end.
        // `sort_by` is stable, so equal timestamps keep feed order.
        items.sort_by(|a, b| b.published.cmp(&a.published));

        // 4) Cap
        let cap = self.cap_for(source);
        if items.len() > cap {
            out.dropped_by_cap = items.len() - cap;
            items.truncate(cap);
        }

        out.items = items;
        out
    }

    fn matches_keywords(&self, item: &FeedItem) -> bool {
        let title = item.title.to_lowercase();
        let summary = item.summary.to_lowercase();
        self.keywords
            .iter()
            .any(|k| title.contains(k.as_str()) || summary.contains(k.as_str()))
    }
}

fn cutoff(max_age_hours: Option<f64>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let hours = max_age_hours.filter(|h| h.is_finite() && *h >= 0.0)?;
    let window = Duration::try_milliseconds((hours * 3_600_000.0) as i64)?;
    now.checked_sub_signed(window)
}
