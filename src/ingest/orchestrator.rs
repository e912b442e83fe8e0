// src/ingest/orchestrator.rs
//! Bounded concurrent fan-out of fetch + filter across all active sources.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::ingest::cache::{CacheEntry, FeedCache};
use crate::ingest::filter::{FilterOutcome, ItemFilter};
use crate::ingest::types::{FeedClient, FeedItem, FetchError, FetchResult, SourceConfig};
use crate::ledger::{DeduplicationLedger, Ledger};

pub const DEFAULT_MAX_WORKERS: usize = 5;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Order in which per-source results are merged before in-run dedup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOrder {
    /// Whichever source finishes first claims a shared identity.
    #[default]
    Completion,
    /// Configured source order; deterministic regardless of timing.
    SourceOrder,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_workers: usize,
    pub fetch_timeout: Duration,
    pub merge_order: MergeOrder,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            merge_order: MergeOrder::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    Fresh,
    Cached,
    NotModified,
    Failed(String),
}

impl SourceOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SourceOutcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceOutcome::Fresh => "fresh",
            SourceOutcome::Cached => "cached",
            SourceOutcome::NotModified => "not_modified",
            SourceOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceReport {
    pub source_id: String,
    pub outcome: SourceOutcome,
    /// Raw items before filtering.
    pub fetched: usize,
    /// Items surviving the filter (before merge/dedup).
    pub kept: usize,
    pub dropped_by_age: usize,
    pub dropped_by_keyword: usize,
    pub dropped_by_cap: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestStats {
    /// One report per active source, in configured order.
    pub sources: Vec<SourceReport>,
    pub skipped: Vec<String>,
    pub in_run_duplicates: usize,
    pub already_seen: usize,
    pub new_items: usize,
}

impl IngestStats {
    pub fn zero_item_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| s.fetched == 0)
            .map(|s| s.source_id.as_str())
            .collect()
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| s.outcome.is_failure())
            .map(|s| s.source_id.as_str())
            .collect()
    }

    pub fn total_fetched(&self) -> usize {
        self.sources.iter().map(|s| s.fetched).sum()
    }
}

struct TaskDone {
    index: usize,
    report: SourceReport,
    items: Vec<FeedItem>,
}

pub struct IngestionOrchestrator {
    client: Arc<dyn FeedClient>,
    cache: Arc<FeedCache>,
    filter: Arc<ItemFilter>,
    dedup: DeduplicationLedger,
    cfg: OrchestratorConfig,
}

impl IngestionOrchestrator {
    pub fn new(
        client: Arc<dyn FeedClient>,
        cache: Arc<FeedCache>,
        filter: ItemFilter,
        dedup: DeduplicationLedger,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            cache,
            filter: Arc::new(filter),
            dedup,
            cfg,
        }
    }

    pub fn cache(&self) -> &Arc<FeedCache> {
        &self.cache
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.cfg
    }

    /// Fetch, filter, merge and partition against `ledger`. Never fails: a
    /// broken source contributes zero items and a `Failed` report.
    pub async fn run(
        &self,
        sources: &[SourceConfig],
        ledger: &Ledger,
        now: DateTime<Utc>,
    ) -> (Vec<FeedItem>, IngestStats) {
        super::ensure_metrics_described();
        let mut stats = IngestStats::default();

        let mut active = Vec::with_capacity(sources.len());
        for src in sources {
            if src.skip {
                tracing::info!(source = %src.url, "source on skip list, not fetching");
                counter!("ingest_sources_skipped_total").increment(1);
                stats.skipped.push(src.url.clone());
            } else {
                active.push(src.clone());
            }
        }

        let sem = Arc::new(Semaphore::new(self.cfg.max_workers.max(1)));
        let mut set = JoinSet::new();
        for (index, src) in active.iter().cloned().enumerate() {
            let sem = sem.clone();
            let client = self.client.clone();
            let cache = self.cache.clone();
            let filter = self.filter.clone();
            let timeout = self.cfg.fetch_timeout;
            set.spawn(async move {
                // The semaphore is never closed.
                let _permit = sem.acquire_owned().await.ok();
                let t0 = Instant::now();
                let (outcome, raw) =
                    match tokio::time::timeout(timeout, fetch_one(&*client, &cache, &src, now))
                        .await
                    {
                        Ok(r) => r,
                        Err(_) => {
                            cache.invalidate(src.source_id());
                            let e = FetchError::Timeout(timeout);
                            tracing::warn!(source = %src.url, error = %e, "source fetch timed out");
                            (SourceOutcome::Failed(e.to_string()), Vec::new())
                        }
                    };
                let fetched = raw.len();
                let FilterOutcome {
                    items,
                    dropped_by_age,
                    dropped_by_keyword,
                    dropped_by_cap,
                } = filter.apply(raw, &src, now);
                TaskDone {
                    index,
                    report: SourceReport {
                        source_id: src.source_id().to_string(),
                        outcome,
                        fetched,
                        kept: items.len(),
                        dropped_by_age,
                        dropped_by_keyword,
                        dropped_by_cap,
                        elapsed_ms: t0.elapsed().as_millis() as u64,
                    },
                    items,
                }
            });
        }

        let mut done: Vec<TaskDone> = Vec::with_capacity(active.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(d) => done.push(d),
                Err(e) => tracing::error!(error = %e, "source task aborted"),
            }
        }

        // Tasks that panicked still get a report.
        let mut reports: Vec<Option<SourceReport>> = vec![None; active.len()];
        for d in &done {
            reports[d.index] = Some(d.report.clone());
        }
        stats.sources = reports
            .into_iter()
            .zip(&active)
            .map(|(r, src)| {
                r.unwrap_or_else(|| SourceReport {
                    source_id: src.source_id().to_string(),
                    outcome: SourceOutcome::Failed("task aborted".to_string()),
                    fetched: 0,
                    kept: 0,
                    dropped_by_age: 0,
                    dropped_by_keyword: 0,
                    dropped_by_cap: 0,
                    elapsed_ms: 0,
                })
            })
            .collect();

        if self.cfg.merge_order == MergeOrder::SourceOrder {
            done.sort_by_key(|d| d.index);
        }
        let (merged, dups) = merge_first_seen(done.into_iter().map(|d| d.items));
        stats.in_run_duplicates = dups;

        let (new_items, seen) = self.dedup.filter_new(ledger, merged, now);
        stats.already_seen = seen.len();
        stats.new_items = new_items.len();

        record_metrics(&stats, now);
        tracing::info!(
            target: "ingest",
            sources = stats.sources.len(),
            skipped = stats.skipped.len(),
            failed = stats.failed_sources().len(),
            fetched = stats.total_fetched(),
            in_run_duplicates = stats.in_run_duplicates,
            already_seen = stats.already_seen,
            new_items = stats.new_items,
            "ingest run finished"
        );

        (new_items, stats)
    }
}

async fn fetch_one(
    client: &dyn FeedClient,
    cache: &FeedCache,
    src: &SourceConfig,
    now: DateTime<Utc>,
) -> (SourceOutcome, Vec<FeedItem>) {
    let id = src.source_id();
    if let Some(hit) = cache.get(id, now) {
        tracing::debug!(source = %id, "fresh cache hit");
        return (SourceOutcome::Cached, hit.items);
    }

    let stale = cache.stale(id);
    let validator = stale.as_ref().and_then(|e| e.validator.clone());
    match client.fetch(&src.url, validator.as_ref()).await {
        FetchResult::Success { items, validator } => {
            cache.put(
                id,
                CacheEntry {
                    source_id: id.to_string(),
                    fetched_at: now,
                    items: items.clone(),
                    validator,
                },
            );
            (SourceOutcome::Fresh, items)
        }
        FetchResult::NotModified => {
            (SourceOutcome::NotModified, stale.map(|e| e.items).unwrap_or_default())
        }
        FetchResult::Failure(e) => {
            cache.invalidate(id);
            (SourceOutcome::Failed(e.to_string()), Vec::new())
        }
    }
}

/// Concatenates batches, dropping any item whose identity was already taken.
/// Items without an identity are always kept. Returns `(merged, duplicates)`.
pub fn merge_first_seen<I>(batches: I) -> (Vec<FeedItem>, usize)
where
    I: IntoIterator<Item = Vec<FeedItem>>,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    let mut dups = 0usize;
    for batch in batches {
        for it in batch {
            if let Some(id) = it.identity() {
                if !seen.insert(id.to_string()) {
                    dups += 1;
                    continue;
                }
            }
            out.push(it);
        }
    }
    (out, dups)
}

fn record_metrics(stats: &IngestStats, now: DateTime<Utc>) {
    for s in &stats.sources {
        counter!("ingest_fetch_total", "outcome" => s.outcome.label()).increment(1);
        counter!("ingest_items_fetched_total").increment(s.fetched as u64);
        counter!("ingest_dropped_total", "stage" => "age").increment(s.dropped_by_age as u64);
        counter!("ingest_dropped_total", "stage" => "keyword")
            .increment(s.dropped_by_keyword as u64);
        counter!("ingest_dropped_total", "stage" => "cap").increment(s.dropped_by_cap as u64);
    }
    counter!("ingest_dropped_total", "stage" => "duplicate")
        .increment(stats.in_run_duplicates as u64);
    counter!("ingest_dropped_total", "stage" => "seen").increment(stats.already_seen as u64);
    counter!("ingest_new_items_total").increment(stats.new_items as u64);
    gauge!("ingest_pipeline_last_run_ts").set(now.timestamp().max(0) as f64);
}
