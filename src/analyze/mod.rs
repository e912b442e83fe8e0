//! Analysis service seam: turns a feed item into relevance, type, keywords
//! and a short summary, and writes the run's tutorial. The ingestion layer
//! never depends on this module.

pub mod openai;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::config::ai::AnalysisConfig;
use crate::ingest::FeedItem;

pub use openai::OpenAiAnalyzer;

/// Characters of item text sent to the service.
pub const MAX_SNIPPET_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    News,
    #[serde(rename = "Research Paper Abstract", alias = "Research")]
    Research,
    #[serde(rename = "Tutorial/Guide", alias = "Tutorial")]
    Tutorial,
    Opinion,
    #[serde(rename = "Market/Competitor Info", alias = "Market")]
    Market,
    #[serde(rename = "Company Update")]
    CompanyUpdate,
    #[serde(other)]
    Other,
}

impl ContentType {
    pub fn is_tutorial(self) -> bool {
        self == ContentType::Tutorial
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// 1..=10, higher is more relevant.
    pub relevance: u8,
    pub content_type: ContentType,
    pub keywords: Vec<String>,
    pub summary: String,
    #[serde(default)]
    pub justification: String,
    #[serde(skip)]
    pub usage: TokenUsage,
}

/// USD per million tokens, split by direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl TokenPricing {
    pub fn is_valid(&self) -> bool {
        [self.input_per_million, self.output_per_million]
            .iter()
            .all(|r| r.is_finite() && *r >= 0.0)
    }

    pub fn estimate(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 / 1e6) * self.input_per_million
            + (usage.completion_tokens as f64 / 1e6) * self.output_per_million
    }
}

/// Markdown tutorial written for one rotation topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedTutorial {
    pub topic: String,
    pub markdown: String,
    #[serde(skip)]
    pub usage: TokenUsage,
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("analysis disabled")]
    Disabled,
    #[error("analysis transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("analysis HTTP status {0}")]
    Status(u16),
    #[error("malformed analysis response: {0}")]
    Malformed(String),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<AnalysisError>,
    },
}

impl AnalysisError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AnalysisError::Disabled | AnalysisError::Exhausted { .. } => false,
            AnalysisError::Status(s) => *s == 429 || *s >= 500,
            AnalysisError::Http(_) | AnalysisError::Malformed(_) => true,
        }
    }
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, text: &str) -> Result<Analysis, AnalysisError>;

    /// Services that only score items leave this at `Err(Disabled)`.
    async fn generate_tutorial(&self, _topic: &str) -> Result<GeneratedTutorial, AnalysisError> {
        Err(AnalysisError::Disabled)
    }

    fn name(&self) -> &'static str;
}

pub type DynAnalyzer = Arc<dyn AnalysisService>;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("analysis_attempts_total", "Calls made to the analysis service.");
        describe_counter!(
            "analysis_failures_total",
            "Analysis or tutorial calls that failed after all retries."
        );
    });
}

/// Attempt count plus the delay before each retry. When there are more
/// retries than entries in `backoff`, the last delay repeats.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![Duration::from_secs(1), Duration::from_secs(3)],
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Vec::new(),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }
}

pub struct RetryingAnalyzer<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: AnalysisService> RetryingAnalyzer<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, AnalysisError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AnalysisError>>,
    {
        ensure_metrics_described();
        let max = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            counter!("analysis_attempts_total").increment(1);
            match call().await {
                Ok(a) => return Ok(a),
                Err(e) if !e.is_retryable() => {
                    counter!("analysis_failures_total").increment(1);
                    return Err(e);
                }
                Err(e) if attempt >= max => {
                    counter!("analysis_failures_total").increment(1);
                    return Err(AnalysisError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        provider = self.inner.name(),
                        op,
                        attempt,
                        max,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "analysis attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl<S: AnalysisService> AnalysisService for RetryingAnalyzer<S> {
    async fn analyze(&self, text: &str) -> Result<Analysis, AnalysisError> {
        self.with_retry("analyze", || self.inner.analyze(text)).await
    }

    async fn generate_tutorial(&self, topic: &str) -> Result<GeneratedTutorial, AnalysisError> {
        self.with_retry("tutorial", || self.inner.generate_tutorial(topic))
            .await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Always `Err(Disabled)` for both operations; used when analysis is switched off.
pub struct DisabledAnalyzer;

#[async_trait]
impl AnalysisService for DisabledAnalyzer {
    async fn analyze(&self, _text: &str) -> Result<Analysis, AnalysisError> {
        Err(AnalysisError::Disabled)
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Prompt input for one item; long summaries are cut to [`MAX_SNIPPET_CHARS`].
pub fn describe_item(item: &FeedItem) -> String {
    let snippet = if item.summary.is_empty() {
        "No content snippet available."
    } else {
        item.summary.as_str()
    };
    let snippet: String = if snippet.chars().count() > MAX_SNIPPET_CHARS {
        let mut s: String = snippet.chars().take(MAX_SNIPPET_CHARS - 3).collect();
        s.push_str("...");
        s
    } else {
        snippet.to_string()
    };
    format!(
        "Title: {}\nURL: {}\nSource: {}\nSnippet: {}",
        item.title, item.link, item.source_id, snippet
    )
}

/// Factory: disabled config gives a [`DisabledAnalyzer`], otherwise the
/// provider wrapped in a [`RetryingAnalyzer`].
pub fn build_analyzer(cfg: &AnalysisConfig) -> Result<DynAnalyzer> {
    if !cfg.enabled {
        return Ok(Arc::new(DisabledAnalyzer));
    }
    match cfg.provider.as_str() {
        "openai" => {
            let provider = OpenAiAnalyzer::from_config(cfg)?;
            Ok(Arc::new(RetryingAnalyzer::new(provider, cfg.retry_policy())))
        }
        other => anyhow::bail!("unsupported analysis provider: {other}"),
    }
}
