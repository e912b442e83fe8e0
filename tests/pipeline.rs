// tests/pipeline.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use feed_digest::analyze::{
    Analysis, AnalysisError, AnalysisService, ContentType, DisabledAnalyzer, GeneratedTutorial,
    TokenPricing, TokenUsage,
};
use feed_digest::config::RecordPolicy;
use feed_digest::deliver::{Digest, DigestSink};
use feed_digest::ingest::{
    FeedCache, FeedClient, FeedItem, FetchError, FetchResult, IngestionOrchestrator, ItemFilter,
    OrchestratorConfig, SourceConfig, Validator,
};
use feed_digest::ledger::DeduplicationLedger;
use feed_digest::pipeline::{Pipeline, PipelineSettings};
use parking_lot::Mutex;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 20, 7, 0, 0).unwrap()
}

fn item(src: &str, slug: &str, hours_ago: i64) -> FeedItem {
    FeedItem {
        title: slug.into(),
        link: format!("https://{src}/{slug}"),
        published: Some(now() - Duration::hours(hours_ago)),
        summary: format!("about {slug}"),
        source_id: src.into(),
        id: None,
    }
}

/// Serves fixed items for "good" and fails everything else.
struct FixedClient;

#[async_trait]
impl FeedClient for FixedClient {
    async fn fetch(&self, url: &str, _validator: Option<&Validator>) -> FetchResult {
        match url {
            "good" => FetchResult::Success {
                items: vec![
                    item("good", "tutorial-rag", 1),
                    item("good", "model-launch", 2),
                    item("good", "broken", 3),
                    item("good", "market-shift", 4),
                ],
                validator: None,
            },
            _ => FetchResult::Failure(FetchError::Status(500)),
        }
    }
}

/// Scores by slug; "broken" always fails. Tutorials fail while
/// `tutorial_down` is set.
#[derive(Default)]
struct SlugAnalyzer {
    tutorial_down: AtomicBool,
}

#[async_trait]
impl AnalysisService for SlugAnalyzer {
    async fn analyze(&self, text: &str) -> Result<Analysis, AnalysisError> {
        let (relevance, content_type) = if text.contains("Title: broken") {
            return Err(AnalysisError::Malformed("nope".into()));
        } else if text.contains("Title: tutorial-rag") {
            (6, ContentType::Tutorial)
        } else if text.contains("Title: model-launch") {
            (9, ContentType::News)
        } else {
            (7, ContentType::Market)
        };
        Ok(Analysis {
            relevance,
            content_type,
            keywords: vec!["k".into()],
            summary: "s".into(),
            justification: String::new(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
        })
    }

    async fn generate_tutorial(&self, topic: &str) -> Result<GeneratedTutorial, AnalysisError> {
        if self.tutorial_down.load(Ordering::SeqCst) {
            return Err(AnalysisError::Status(503));
        }
        Ok(GeneratedTutorial {
            topic: topic.to_string(),
            markdown: format!("## Skill Up Tutorial: {topic}"),
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
            },
        })
    }

    fn name(&self) -> &'static str {
        "slug"
    }
}

#[derive(Default)]
struct RecordingSink {
    fail: AtomicBool,
    delivered: Mutex<Vec<Digest>>,
}

#[async_trait]
impl DigestSink for RecordingSink {
    async fn deliver(&self, digest: &Digest) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("smtp down");
        }
        self.delivered.lock().push(digest.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

struct Harness {
    pipeline: Pipeline,
    sink: Arc<RecordingSink>,
    _dir: tempfile::TempDir,
}

fn harness(policy: RecordPolicy, analyzer: Arc<dyn AnalysisService>) -> Harness {
    priced_harness(policy, analyzer, None)
}

fn priced_harness(
    policy: RecordPolicy,
    analyzer: Arc<dyn AnalysisService>,
    pricing: Option<TokenPricing>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let dedup = DeduplicationLedger::new(dir.path().join("seen.json"), Duration::days(7));
    let orchestrator = IngestionOrchestrator::new(
        Arc::new(FixedClient),
        // Zero freshness so every run goes to the client.
        Arc::new(FeedCache::new(Duration::zero())),
        ItemFilter::default(),
        dedup.clone(),
        OrchestratorConfig::default(),
    );
    let sink = Arc::new(RecordingSink::default());
    let settings = PipelineSettings {
        record_policy: policy,
        empty_run_threshold: 2,
        num_items: 5,
        num_tutorials: 5,
        tutorial_topics: vec!["RAG".into(), "evals".into()],
        state_path: dir.path().join("state.json"),
        pricing,
        ..Default::default()
    };
    let pipeline = Pipeline::new(
        orchestrator,
        dedup,
        analyzer,
        sink.clone(),
        vec![SourceConfig::new("good"), SourceConfig::new("dead")],
        settings,
    );
    Harness {
        pipeline,
        sink,
        _dir: dir,
    }
}

#[tokio::test]
async fn end_to_end_run_delivers_ranks_and_records() {
    let h = harness(RecordPolicy::Delivered, Arc::new(SlugAnalyzer::default()));
    let report = h.pipeline.run_once(now()).await;

    assert_eq!(report.stats.new_items, 4);
    assert_eq!(report.analyzed, 3);
    assert_eq!(report.analysis_failures, 1);
    assert!(report.delivered);
    assert_eq!(report.recorded, 3);
    // three item analyses plus the tutorial
    assert_eq!(report.usage.total(), 45 + 150);
    assert_eq!(report.topic.as_deref(), Some("RAG"));
    assert_eq!(report.estimated_cost, None);

    let delivered = h.sink.delivered.lock().clone();
    assert_eq!(delivered.len(), 1);
    let news: Vec<_> = delivered[0].news.iter().map(|e| e.item.title.as_str()).collect();
    let tuts: Vec<_> = delivered[0]
        .tutorials
        .iter()
        .map(|e| e.item.title.as_str())
        .collect();
    assert_eq!(news, vec!["model-launch", "market-shift"]);
    assert_eq!(tuts, vec!["tutorial-rag"]);
    let tutorial = delivered[0].generated_tutorial.as_ref().unwrap();
    assert_eq!(tutorial.topic, "RAG");
    assert!(tutorial.markdown.starts_with("## Skill Up Tutorial: RAG"));

    // Same items an hour later: everything delivered is now seen; the item
    // whose analysis failed was never recorded and comes back.
    let again = h.pipeline.run_once(now() + Duration::hours(1)).await;
    assert_eq!(again.stats.already_seen, 3);
    assert_eq!(again.stats.new_items, 1);
    assert!(!again.delivered, "only the failing item remains");
}

#[tokio::test]
async fn failed_delivery_records_nothing_under_delivered_policy() {
    let h = harness(RecordPolicy::Delivered, Arc::new(SlugAnalyzer::default()));
    h.sink.fail.store(true, Ordering::SeqCst);

    let report = h.pipeline.run_once(now()).await;
    assert!(!report.delivered);
    assert_eq!(report.recorded, 0);
    assert_eq!(report.topic.as_deref(), Some("RAG"));

    h.sink.fail.store(false, Ordering::SeqCst);
    let retry = h.pipeline.run_once(now() + Duration::hours(1)).await;
    assert_eq!(retry.stats.already_seen, 0);
    assert!(retry.delivered);
    // The tutorial was written on the first run, so the cursor moved on.
    assert_eq!(retry.topic.as_deref(), Some("evals"));
}

#[tokio::test]
async fn failed_tutorial_keeps_its_topic_for_the_next_run() {
    let analyzer = Arc::new(SlugAnalyzer::default());
    analyzer.tutorial_down.store(true, Ordering::SeqCst);
    let h = harness(RecordPolicy::Delivered, analyzer.clone());
    h.sink.fail.store(true, Ordering::SeqCst);

    let first = h.pipeline.run_once(now()).await;
    assert_eq!(first.topic, None);
    assert_eq!(first.usage.total(), 45);

    analyzer.tutorial_down.store(false, Ordering::SeqCst);
    h.sink.fail.store(false, Ordering::SeqCst);
    let second = h.pipeline.run_once(now() + Duration::hours(1)).await;
    assert!(second.delivered);
    assert_eq!(second.topic.as_deref(), Some("RAG"));

    let delivered = h.sink.delivered.lock().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].tutorial_topic(), Some("RAG"));
}

#[tokio::test]
async fn configured_pricing_estimates_run_cost() {
    let h = priced_harness(
        RecordPolicy::Delivered,
        Arc::new(SlugAnalyzer::default()),
        Some(TokenPricing {
            input_per_million: 1_000.0,
            output_per_million: 2_000.0,
        }),
    );
    let report = h.pipeline.run_once(now()).await;
    // prompt 130, completion 65
    let cost = report.estimated_cost.unwrap();
    assert!((cost - 0.26).abs() < 1e-9, "{cost}");
}

#[tokio::test]
async fn assembled_policy_records_even_when_delivery_fails() {
    let h = harness(RecordPolicy::Assembled, Arc::new(SlugAnalyzer::default()));
    h.sink.fail.store(true, Ordering::SeqCst);

    let report = h.pipeline.run_once(now()).await;
    assert!(!report.delivered);
    assert_eq!(report.recorded, 3);

    let next = h.pipeline.run_once(now() + Duration::hours(1)).await;
    assert_eq!(next.stats.already_seen, 3);
}

#[tokio::test]
async fn dead_source_is_flagged_and_disabled_analysis_degrades() {
    let h = harness(RecordPolicy::Delivered, Arc::new(DisabledAnalyzer));

    let first = h.pipeline.run_once(now()).await;
    assert!(first.flagged.is_empty());
    // Disabled analysis passes items through untouched and writes no tutorial.
    assert_eq!(first.analyzed, 4);
    assert_eq!(first.analysis_failures, 0);
    assert!(first.delivered);
    assert_eq!(first.topic, None);

    let second = h.pipeline.run_once(now() + Duration::hours(1)).await;
    assert_eq!(second.flagged, vec!["dead".to_string()]);
    assert_eq!(second.topic, None);

    let delivered = h.sink.delivered.lock().clone();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].generated_tutorial.is_none());
}
