// src/pipeline.rs
//! One digest run: ingest → analyze → assemble → tutorial → deliver → record → persist.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::analyze::{
    build_analyzer, describe_item, Analysis, AnalysisError, ContentType, DynAnalyzer,
    GeneratedTutorial, TokenPricing, TokenUsage,
};
use crate::config::{AppConfig, RecordPolicy, SinkKind};
use crate::deliver::{Digest, DigestEntry, DigestSink, FileSink, LogSink};
use crate::ingest::{
    FeedCache, FeedItem, HttpFeedClient, IngestStats, IngestionOrchestrator, ItemFilter,
    OrchestratorConfig, SourceConfig,
};
use crate::ledger::DeduplicationLedger;
use crate::state::RunState;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub record_policy: RecordPolicy,
    pub empty_run_threshold: u32,
    pub num_items: usize,
    pub num_tutorials: usize,
    pub tutorial_topics: Vec<String>,
    pub analysis_concurrency: usize,
    pub subject_prefix: String,
    pub state_path: PathBuf,
    /// Per-million token rates for the cost estimate in the run summary.
    pub pricing: Option<TokenPricing>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            record_policy: RecordPolicy::Delivered,
            empty_run_threshold: crate::state::DEFAULT_EMPTY_RUN_THRESHOLD,
            num_items: 7,
            num_tutorials: 5,
            tutorial_topics: Vec::new(),
            analysis_concurrency: 3,
            subject_prefix: "[AI Digest]".to_string(),
            state_path: PathBuf::from(crate::state::DEFAULT_STATE_PATH),
            pricing: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub stats: IngestStats,
    pub analyzed: usize,
    pub analysis_failures: usize,
    pub digest_items: usize,
    pub delivered: bool,
    /// Identities written to the ledger this run.
    pub recorded: usize,
    /// Sources at or over the consecutive-empty-run threshold.
    pub flagged: Vec<String>,
    pub usage: TokenUsage,
    /// Topic of the tutorial generated this run.
    pub topic: Option<String>,
    /// USD, only when pricing is configured.
    pub estimated_cost: Option<f64>,
}

pub struct Pipeline {
    orchestrator: IngestionOrchestrator,
    dedup: DeduplicationLedger,
    analyzer: DynAnalyzer,
    sink: Arc<dyn DigestSink>,
    sources: Vec<SourceConfig>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        orchestrator: IngestionOrchestrator,
        dedup: DeduplicationLedger,
        analyzer: DynAnalyzer,
        sink: Arc<dyn DigestSink>,
        sources: Vec<SourceConfig>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            orchestrator,
            dedup,
            analyzer,
            sink,
            sources,
            settings,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let client = Arc::new(HttpFeedClient::new(
            &cfg.ingest.user_agent,
            cfg.ingest.fetch_timeout(),
        )?);
        let cache = Arc::new(FeedCache::new(cfg.cache.freshness()));
        let filter = ItemFilter::new(&cfg.ingest.required_keywords, cfg.ingest.limits.default);
        let dedup = DeduplicationLedger::new(cfg.ledger.path.clone(), cfg.ledger.retention());
        let orchestrator = IngestionOrchestrator::new(
            client,
            cache,
            filter,
            dedup.clone(),
            OrchestratorConfig {
                max_workers: cfg.ingest.max_workers,
                fetch_timeout: cfg.ingest.fetch_timeout(),
                merge_order: cfg.ingest.merge_order,
            },
        );
        let sink: Arc<dyn DigestSink> = match cfg.output.sink {
            SinkKind::File => Arc::new(FileSink::new(cfg.output.dir.clone())),
            SinkKind::Log => Arc::new(LogSink),
        };
        let settings = PipelineSettings {
            record_policy: cfg.ledger.record_policy,
            empty_run_threshold: cfg.state.empty_run_alert_threshold,
            num_items: cfg.analysis.num_items,
            num_tutorials: cfg.analysis.num_tutorials,
            tutorial_topics: cfg.analysis.tutorial_topics.clone(),
            analysis_concurrency: cfg.analysis.max_concurrency,
            subject_prefix: cfg.output.subject_prefix.clone(),
            state_path: cfg.state.path.clone(),
            pricing: cfg.analysis.pricing,
        };
        Ok(Self::new(
            orchestrator,
            dedup,
            build_analyzer(&cfg.analysis)?,
            sink,
            cfg.source_configs(),
            settings,
        ))
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    /// Never fails; persistence and delivery errors are logged and reflected
    /// in the report.
    pub async fn run_once(&self, now: DateTime<Utc>) -> RunReport {
        let mut ledger = self.dedup.load();
        let mut state = RunState::load(&self.settings.state_path);

        let (new_items, stats) = self.orchestrator.run(&self.sources, &ledger, now).await;

        let flagged = state
            .source_health
            .observe(&stats, self.settings.empty_run_threshold);
        for src in &flagged {
            tracing::warn!(
                source = %src,
                empty_runs = state.source_health.empty_runs(src),
                "source has produced no items for consecutive runs"
            );
        }

        let (entries, failures, mut usage) = self.analyze_all(new_items).await;
        let analyzed = entries.len();

        let mut digest = assemble(
            entries,
            &self.settings.subject_prefix,
            self.settings.num_items,
            self.settings.num_tutorials,
            now,
        );

        let delivered = if digest.is_empty() {
            tracing::info!("nothing new to deliver");
            false
        } else {
            if let Some(tutorial) = self.generate_tutorial(&state).await {
                usage.add(tutorial.usage);
                state.topic_cursor.advance(&self.settings.tutorial_topics);
                digest.generated_tutorial = Some(tutorial);
            }
            match self.sink.deliver(&digest).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(sink = self.sink.name(), error = ?e, "digest delivery failed");
                    false
                }
            }
        };

        let to_record = match (self.settings.record_policy, delivered) {
            (RecordPolicy::Assembled, _) | (RecordPolicy::Delivered, true) => digest.items(),
            (RecordPolicy::Delivered, false) => Vec::new(),
        };
        self.dedup.record(&mut ledger, &to_record, now);
        if let Err(e) = self.dedup.save(&mut ledger, now) {
            tracing::error!(path = ?self.dedup.path(), error = %e, "failed to save ledger");
        }
        if let Err(e) = state.save(&self.settings.state_path) {
            tracing::error!(error = ?e, "failed to save run state");
        }

        let report = RunReport {
            stats,
            analyzed,
            analysis_failures: failures,
            digest_items: digest.items().len(),
            delivered,
            recorded: to_record.len(),
            flagged,
            usage,
            topic: digest.tutorial_topic().map(str::to_string),
            estimated_cost: self.settings.pricing.map(|p| p.estimate(&usage)),
        };
        tracing::info!(
            target: "ingest",
            new_items = report.stats.new_items,
            analyzed = report.analyzed,
            analysis_failures = report.analysis_failures,
            digest_items = report.digest_items,
            delivered = report.delivered,
            recorded = report.recorded,
            tokens = report.usage.total(),
            estimated_cost_usd = report.estimated_cost,
            "digest run finished"
        );
        report
    }

    /// Writes the tutorial for the cursor's current topic. The caller only
    /// advances the cursor on success, so a failed topic is retried next run.
    async fn generate_tutorial(&self, state: &RunState) -> Option<GeneratedTutorial> {
        let topic = state.topic_cursor.peek(&self.settings.tutorial_topics)?;
        match self.analyzer.generate_tutorial(topic).await {
            Ok(t) => {
                tracing::info!(topic, tokens = t.usage.total(), "tutorial generated");
                Some(t)
            }
            Err(AnalysisError::Disabled) => {
                tracing::debug!(topic, "analysis disabled, no tutorial");
                None
            }
            Err(e) => {
                tracing::warn!(topic, error = %e, "tutorial generation failed");
                None
            }
        }
    }

    /// Bounded concurrent analysis. Failed items are dropped; results keep
    /// ingest order.
    async fn analyze_all(&self, items: Vec<FeedItem>) -> (Vec<DigestEntry>, usize, TokenUsage) {
        let sem = Arc::new(Semaphore::new(self.settings.analysis_concurrency.max(1)));
        let mut set = JoinSet::new();
        for (idx, item) in items.into_iter().enumerate() {
            let sem = sem.clone();
            let analyzer = self.analyzer.clone();
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let res = analyzer.analyze(&describe_item(&item)).await;
                (idx, item, res)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(r) => results.push(r),
                Err(e) => tracing::error!(error = %e, "analysis task aborted"),
            }
        }
        results.sort_by_key(|(idx, _, _)| *idx);

        let mut usage = TokenUsage::default();
        let mut failures = 0usize;
        let mut entries = Vec::with_capacity(results.len());
        for (_, item, res) in results {
            match res {
                Ok(analysis) => {
                    usage.add(analysis.usage);
                    entries.push(DigestEntry { item, analysis });
                }
                Err(AnalysisError::Disabled) => {
                    let analysis = passthrough(&item);
                    entries.push(DigestEntry { item, analysis });
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(link = %item.link, error = %e, "dropping item, analysis failed");
                }
            }
        }
        (entries, failures, usage)
    }
}

/// Stand-in when analysis is switched off: lowest relevance, feed summary.
fn passthrough(item: &FeedItem) -> Analysis {
    Analysis {
        relevance: 1,
        content_type: ContentType::News,
        keywords: Vec::new(),
        summary: item.summary.clone(),
        justification: String::new(),
        usage: TokenUsage::default(),
    }
}

/// Ranks by relevance (stable) and splits tutorials from everything else.
pub fn assemble(
    mut entries: Vec<DigestEntry>,
    subject_prefix: &str,
    num_items: usize,
    num_tutorials: usize,
    now: DateTime<Utc>,
) -> Digest {
    entries.sort_by(|a, b| b.analysis.relevance.cmp(&a.analysis.relevance));
    let (tutorials, news): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .partition(|e| e.analysis.content_type.is_tutorial());

    let mut digest = Digest::new(subject_prefix, now);
    digest.news = news.into_iter().take(num_items).collect();
    digest.tutorials = tutorials.into_iter().take(num_tutorials).collect();
    digest
}
