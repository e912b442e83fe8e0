// tests/orchestrator.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use feed_digest::ingest::{
    CacheEntry, FeedCache, FeedClient, FeedItem, FetchError, FetchResult, IngestionOrchestrator, ItemFilter,
    MergeOrder, OrchestratorConfig, SourceConfig, SourceOutcome, Validator,
};
use feed_digest::ledger::{DeduplicationLedger, Ledger};
use parking_lot::Mutex;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 20, 12, 0, 0).unwrap()
}

fn item(src: &str, n: u32, hours_ago: i64) -> FeedItem {
    FeedItem {
        title: format!("{src}-{n}"),
        link: format!("https://{src}.example.com/{n}"),
        published: Some(now() - Duration::hours(hours_ago)),
        summary: String::new(),
        source_id: src.into(),
        id: None,
    }
}

#[derive(Clone)]
enum Canned {
    Items(Vec<FeedItem>),
    NotModified,
    Fail,
    Hang,
}

/// Scripted client: per-URL response, call log, and in-flight tracking.
#[derive(Default)]
struct MockClient {
    responses: Mutex<HashMap<String, Canned>>,
    calls: Mutex<Vec<(String, Option<Validator>)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<StdDuration>,
}

impl MockClient {
    fn with(responses: &[(&str, Canned)]) -> Self {
        Self {
            responses: Mutex::new(
                responses
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn set(&self, url: &str, c: Canned) {
        self.responses.lock().insert(url.to_string(), c);
    }

    fn call_count(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|(u, _)| u == url).count()
    }
}

#[async_trait]
impl FeedClient for MockClient {
    async fn fetch(&self, source_url: &str, validator: Option<&Validator>) -> FetchResult {
        self.calls
            .lock()
            .push((source_url.to_string(), validator.cloned()));
        let cur = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(cur, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let canned = self.responses.lock().get(source_url).cloned();
        let out = match canned {
            Some(Canned::Items(items)) => FetchResult::Success {
                items,
                validator: Some(Validator {
                    etag: Some(format!("\"{source_url}\"")),
                    last_modified: None,
                }),
            },
            Some(Canned::NotModified) => FetchResult::NotModified,
            Some(Canned::Hang) => {
                tokio::time::sleep(StdDuration::from_secs(3600)).await;
                FetchResult::NotModified
            }
            Some(Canned::Fail) | None => FetchResult::Failure(FetchError::Status(503)),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

fn orchestrator(client: Arc<MockClient>, cfg: OrchestratorConfig) -> IngestionOrchestrator {
    IngestionOrchestrator::new(
        client,
        Arc::new(FeedCache::default()),
        ItemFilter::default(),
        DeduplicationLedger::in_memory(Duration::days(7)),
        cfg,
    )
}

#[tokio::test]
async fn failing_source_does_not_block_others() {
    let client = Arc::new(MockClient::with(&[
        ("A", Canned::Items(vec![item("A", 1, 1), item("A", 2, 2)])),
        ("B", Canned::Fail),
        ("C", Canned::Items(vec![item("C", 1, 3)])),
    ]));
    let orch = orchestrator(client, OrchestratorConfig::default());
    let sources = [SourceConfig::new("A"), SourceConfig::new("B"), SourceConfig::new("C")];

    let (items, stats) = orch.run(&sources, &Ledger::new(), now()).await;

    let mut titles: Vec<_> = items.iter().map(|i| i.title.clone()).collect();
    titles.sort();
    assert_eq!(titles, vec!["A-1", "A-2", "C-1"]);

    let ids: Vec<_> = stats.sources.iter().map(|s| s.source_id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B", "C"], "reports follow configured order");
    let b = &stats.sources[1];
    assert_eq!(b.fetched, 0);
    assert!(b.outcome.is_failure());
    assert_eq!(stats.failed_sources(), vec!["B"]);
    assert_eq!(stats.zero_item_sources(), vec!["B"]);
    assert!(orch.cache().stale("B").is_none());
}

#[tokio::test]
async fn skipped_sources_are_never_fetched() {
    let client = Arc::new(MockClient::with(&[
        ("A", Canned::Items(vec![item("A", 1, 1)])),
        ("S", Canned::Items(vec![item("S", 1, 1)])),
    ]));
    let orch = orchestrator(client.clone(), OrchestratorConfig::default());
    let sources = [SourceConfig::new("A"), SourceConfig::new("S").skipped()];

    let (items, stats) = orch.run(&sources, &Ledger::new(), now()).await;

    assert_eq!(items.len(), 1);
    assert_eq!(stats.skipped, vec!["S".to_string()]);
    assert_eq!(stats.sources.len(), 1);
    assert_eq!(client.call_count("S"), 0);
}

#[tokio::test]
async fn fresh_cache_hit_skips_network_and_not_modified_reuses_items() {
    let client = Arc::new(MockClient::with(&[(
        "A",
        Canned::Items(vec![item("A", 1, 1), item("A", 2, 2)]),
    )]));
    let orch = orchestrator(client.clone(), OrchestratorConfig::default());
    let sources = [SourceConfig::new("A")];

    let (_, first) = orch.run(&sources, &Ledger::new(), now()).await;
    assert_eq!(first.sources[0].outcome, SourceOutcome::Fresh);

    // Within the freshness window: served from cache.
    let (items, second) = orch
        .run(&sources, &Ledger::new(), now() + Duration::seconds(60))
        .await;
    assert_eq!(second.sources[0].outcome, SourceOutcome::Cached);
    assert_eq!(items.len(), 2);
    assert_eq!(client.call_count("A"), 1);

    // Past the window: conditional request with the stored validator.
    client.set("A", Canned::NotModified);
    let (items, third) = orch
        .run(&sources, &Ledger::new(), now() + Duration::seconds(301))
        .await;
    assert_eq!(third.sources[0].outcome, SourceOutcome::NotModified);
    assert_eq!(items.len(), 2);
    let calls = client.calls.lock().clone();
    assert_eq!(
        calls.last().and_then(|(_, v)| v.clone()).and_then(|v| v.etag),
        Some("\"A\"".to_string())
    );
}

#[tokio::test]
async fn not_modified_without_cache_yields_nothing() {
    let client = Arc::new(MockClient::with(&[("A", Canned::NotModified)]));
    let orch = orchestrator(client, OrchestratorConfig::default());
    let (items, stats) = orch
        .run(&[SourceConfig::new("A")], &Ledger::new(), now())
        .await;
    assert!(items.is_empty());
    assert_eq!(stats.sources[0].outcome, SourceOutcome::NotModified);
    assert_eq!(stats.sources[0].fetched, 0);
}

#[tokio::test]
async fn concurrency_never_exceeds_worker_limit() {
    let responses: Vec<(String, Canned)> = (0..12)
        .map(|i| (format!("S{i}"), Canned::Items(vec![item(&format!("S{i}"), 1, 1)])))
        .collect();
    let mut client = MockClient::with(
        &responses
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect::<Vec<_>>(),
    );
    client.delay = Some(StdDuration::from_millis(20));
    let client = Arc::new(client);

    let orch = orchestrator(
        client.clone(),
        OrchestratorConfig {
            max_workers: 3,
            ..Default::default()
        },
    );
    let sources: Vec<_> = (0..12).map(|i| SourceConfig::new(format!("S{i}"))).collect();
    let (items, _) = orch.run(&sources, &Ledger::new(), now()).await;

    assert_eq!(items.len(), 12);
    let peak = client.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak}");
}

#[tokio::test(start_paused = true)]
async fn hung_source_times_out_alone() {
    let client = Arc::new(MockClient::with(&[
        ("A", Canned::Items(vec![item("A", 1, 1)])),
        ("H", Canned::Hang),
    ]));
    let orch = orchestrator(
        client,
        OrchestratorConfig {
            fetch_timeout: StdDuration::from_secs(5),
            ..Default::default()
        },
    );
    let (items, stats) = orch
        .run(
            &[SourceConfig::new("A"), SourceConfig::new("H")],
            &Ledger::new(),
            now(),
        )
        .await;
    assert_eq!(items.len(), 1);
    match &stats.sources[1].outcome {
        SourceOutcome::Failed(reason) => assert!(reason.contains("timed out")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_source_loses_its_stale_cache_entry() {
    let client = Arc::new(MockClient::with(&[("H", Canned::Hang)]));
    let orch = orchestrator(
        client.clone(),
        OrchestratorConfig {
            fetch_timeout: StdDuration::from_secs(5),
            ..Default::default()
        },
    );
    // Expired entry: the run must go to the network with its validator.
    orch.cache().put(
        "H",
        CacheEntry {
            source_id: "H".into(),
            fetched_at: now() - Duration::minutes(10),
            items: vec![item("H", 1, 1)],
            validator: Some(Validator {
                etag: Some("\"h\"".into()),
                last_modified: None,
            }),
        },
    );

    let (items, stats) = orch
        .run(&[SourceConfig::new("H")], &Ledger::new(), now())
        .await;
    assert!(items.is_empty());
    assert!(stats.sources[0].outcome.is_failure());
    assert_eq!(client.call_count("H"), 1);
    let sent = client.calls.lock()[0].1.clone().and_then(|v| v.etag);
    assert_eq!(sent.as_deref(), Some("\"h\""));
    assert!(orch.cache().stale("H").is_none());
    assert!(orch.cache().is_empty());
}

#[tokio::test]
async fn shared_identity_is_kept_once_in_source_order() {
    let mut shared_a = item("A", 1, 1);
    shared_a.id = Some("guid-1".into());
    let mut shared_b = item("B", 1, 1);
    shared_b.id = Some("guid-1".into());

    let client = Arc::new(MockClient::with(&[
        ("A", Canned::Items(vec![shared_a])),
        ("B", Canned::Items(vec![shared_b, item("B", 2, 2)])),
    ]));
    let orch = orchestrator(
        client,
        OrchestratorConfig {
            merge_order: MergeOrder::SourceOrder,
            ..Default::default()
        },
    );
    let (items, stats) = orch
        .run(
            &[SourceConfig::new("A"), SourceConfig::new("B")],
            &Ledger::new(),
            now(),
        )
        .await;

    assert_eq!(stats.in_run_duplicates, 1);
    assert_eq!(items.len(), 2);
    let winner = items
        .iter()
        .find(|i| i.identity() == Some("guid-1"))
        .unwrap();
    assert_eq!(winner.source_id, "A");
}

#[tokio::test]
async fn ledger_hits_are_removed_and_counted() {
    let client = Arc::new(MockClient::with(&[(
        "A",
        Canned::Items(vec![item("A", 1, 1), item("A", 2, 2)]),
    )]));
    let orch = orchestrator(client, OrchestratorConfig::default());

    let mut ledger = Ledger::new();
    ledger.insert("https://A.example.com/1".into(), now() - Duration::days(1));

    let (items, stats) = orch.run(&[SourceConfig::new("A")], &ledger, now()).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "A-2");
    assert_eq!(stats.already_seen, 1);
    assert_eq!(stats.new_items, 1);
}

#[tokio::test]
async fn per_source_filter_counts_are_reported() {
    let client = Arc::new(MockClient::with(&[(
        "A",
        Canned::Items(vec![item("A", 1, 1), item("A", 2, 60), item("A", 3, 2)]),
    )]));
    let orch = orchestrator(client, OrchestratorConfig::default());
    let src = SourceConfig::new("A").with_max_age_hours(48.0).with_cap(1);

    let (items, stats) = orch.run(&[src], &Ledger::new(), now()).await;
    assert_eq!(items.len(), 1);
    let r = &stats.sources[0];
    assert_eq!((r.fetched, r.kept), (3, 1));
    assert_eq!((r.dropped_by_age, r.dropped_by_cap), (1, 1));
}
