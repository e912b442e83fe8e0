// src/config/ai.rs
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analyze::{RetryPolicy, TokenPricing};

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key() -> String {
    "ENV".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> Vec<u64> {
    vec![1000, 3000]
}
fn default_max_concurrency() -> usize {
    3
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_num_items() -> usize {
    7
}
fn default_num_tutorials() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Only "openai" (any OpenAI-compatible endpoint) for now.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// "ENV" means: read from LLM_API_KEY, then OPENAI_API_KEY.
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_num_items")]
    pub num_items: usize,
    #[serde(default = "default_num_tutorials")]
    pub num_tutorials: usize,
    #[serde(default)]
    pub tutorial_topics: Vec<String>,
    /// `[analysis.pricing]`; enables the per-run cost estimate.
    #[serde(default)]
    pub pricing: Option<TokenPricing>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            model: default_model(),
            api_key: default_api_key(),
            base_url: default_base_url(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_concurrency: default_max_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            num_items: default_num_items(),
            num_tutorials: default_num_tutorials(),
            tutorial_topics: Vec::new(),
            pricing: None,
        }
    }
}

impl AnalysisConfig {
    /// Normalizes fields and resolves `api_key = "ENV"`. Only an enabled
    /// section without a usable key is an error.
    pub fn resolve(&mut self) -> anyhow::Result<()> {
        self.provider = self.provider.trim().to_lowercase();

        if self.api_key.trim().eq_ignore_ascii_case("env") {
            self.api_key = env::var("LLM_API_KEY")
                .or_else(|_| env::var("OPENAI_API_KEY"))
                .unwrap_or_default();
        }
        if self.enabled && self.api_key.trim().is_empty() {
            anyhow::bail!("analysis enabled but no api key (set LLM_API_KEY or OPENAI_API_KEY)");
        }

        if self.max_attempts == 0 {
            tracing::warn!("analysis.max_attempts = 0, using {}", default_max_attempts());
            self.max_attempts = default_max_attempts();
        }
        if self.max_concurrency == 0 {
            tracing::warn!(
                "analysis.max_concurrency = 0, using {}",
                default_max_concurrency()
            );
            self.max_concurrency = default_max_concurrency();
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        self.tutorial_topics.retain(|t| !t.trim().is_empty());
        if let Some(p) = self.pricing.filter(|p| !p.is_valid()) {
            tracing::warn!(?p, "invalid analysis.pricing, cost estimate off");
            self.pricing = None;
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: self
                .backoff_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}
