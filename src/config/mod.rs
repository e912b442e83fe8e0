// src/config/mod.rs
//! Typed application config loaded from TOML, then patched from env and
//! validated once. Bad values fall back to defaults with a warning; only an
//! unreadable file is fatal.

pub mod ai;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::ingest::client::DEFAULT_USER_AGENT;
use crate::ingest::filter::DEFAULT_ITEM_CAP;
use crate::ingest::{MergeOrder, SourceConfig};

pub use ai::AnalysisConfig;

const ENV_PATH: &str = "DIGEST_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/digest.toml";

/// Upper bounds; larger values fall back to the default.
const MAX_FRESHNESS_SECS: i64 = 7 * 86_400;
const MAX_RETENTION_DAYS: i64 = 3_650;
pub(crate) const MAX_INTERVAL_SECS: u64 = 366 * 86_400;

fn default_max_workers() -> usize {
    5
}
fn default_fetch_timeout_secs() -> u64 {
    20
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_freshness_secs() -> i64 {
    300
}
fn default_ledger_path() -> PathBuf {
    PathBuf::from("state/seen_items.json")
}
fn default_retention_days() -> i64 {
    7
}
fn default_state_path() -> PathBuf {
    PathBuf::from(crate::state::DEFAULT_STATE_PATH)
}
fn default_empty_run_threshold() -> u32 {
    crate::state::DEFAULT_EMPTY_RUN_THRESHOLD
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_subject_prefix() -> String {
    "[AI Digest]".to_string()
}
fn default_interval_secs() -> u64 {
    86_400
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ingest: IngestSection,
    pub cache: CacheSection,
    pub ledger: LedgerSection,
    pub state: StateSection,
    pub analysis: AnalysisConfig,
    pub output: OutputSection,
    pub schedule: ScheduleSection,
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSection {
    #[serde(default)]
    pub feeds: Vec<String>,
    /// Number or absent. Anything else disables the recency filter.
    #[serde(default)]
    pub max_hours_since_published: Option<toml::Value>,
    #[serde(default)]
    pub required_keywords: Vec<String>,
    #[serde(default)]
    pub skip_feeds: Vec<String>,
    /// url → cap, plus an optional `default` key.
    #[serde(default)]
    pub feed_limits: BTreeMap<String, toml::Value>,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub merge_order: MergeOrder,

    #[serde(skip)]
    pub max_age_hours: Option<f64>,
    #[serde(skip)]
    pub limits: FeedLimits,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            feeds: Vec::new(),
            max_hours_since_published: None,
            required_keywords: Vec::new(),
            skip_feeds: Vec::new(),
            feed_limits: BTreeMap::new(),
            max_workers: default_max_workers(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            user_agent: default_user_agent(),
            merge_order: MergeOrder::default(),
            max_age_hours: None,
            limits: FeedLimits::default(),
        }
    }
}

impl IngestSection {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Resolved per-source caps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedLimits {
    pub default: usize,
    pub per_source: BTreeMap<String, usize>,
}

impl Default for FeedLimits {
    fn default() -> Self {
        Self {
            default: DEFAULT_ITEM_CAP,
            per_source: BTreeMap::new(),
        }
    }
}

impl FeedLimits {
    pub fn for_source(&self, url: &str) -> usize {
        self.per_source.get(url).copied().unwrap_or(self.default)
    }

    pub fn resolve(raw: &BTreeMap<String, toml::Value>) -> Self {
        let mut out = FeedLimits::default();
        if let Some(v) = raw.get("default") {
            match positive_count(v) {
                Some(n) => out.default = n,
                None => tracing::warn!(
                    value = %v,
                    fallback = DEFAULT_ITEM_CAP,
                    "invalid feed_limits.default, using fallback"
                ),
            }
        }
        for (url, v) in raw.iter().filter(|(k, _)| k.as_str() != "default") {
            match positive_count(v) {
                Some(n) => {
                    out.per_source.insert(url.trim().to_string(), n);
                }
                None => tracing::warn!(
                    source = %url,
                    value = %v,
                    fallback = out.default,
                    "invalid feed limit, using default"
                ),
            }
        }
        out
    }
}

/// Integer, float or numeric string.
fn numeric(v: &toml::Value) -> Option<f64> {
    match v {
        toml::Value::Integer(i) => Some(*i as f64),
        toml::Value::Float(f) => Some(*f),
        toml::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn positive_count(v: &toml::Value) -> Option<usize> {
    let n = numeric(v)?;
    (n.is_finite() && n >= 1.0).then(|| n.floor() as usize)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: i64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            freshness_secs: default_freshness_secs(),
        }
    }
}

impl CacheSection {
    pub fn freshness(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.freshness_secs)
            .unwrap_or_else(|| chrono::Duration::seconds(default_freshness_secs()))
    }
}

/// Which items get marked as seen after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPolicy {
    /// Only when the sink confirmed delivery.
    #[default]
    Delivered,
    /// Everything that made it into the digest, even if delivery failed.
    Assembled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSection {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default)]
    pub record_policy: RecordPolicy,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            retention_days: default_retention_days(),
            record_policy: RecordPolicy::default(),
        }
    }
}

impl LedgerSection {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::try_days(self.retention_days)
            .unwrap_or_else(|| chrono::Duration::days(default_retention_days()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSection {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
    #[serde(default = "default_empty_run_threshold")]
    pub empty_run_alert_threshold: u32,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            path: default_state_path(),
            empty_run_alert_threshold: default_empty_run_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    File,
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSection {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default)]
    pub sink: SinkKind,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            subject_prefix: default_subject_prefix(),
            sink: SinkKind::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Once,
    Schedule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSection {
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub initial_run: bool,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            run_mode: RunMode::default(),
            interval_secs: default_interval_secs(),
            initial_run: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSection {
    /// e.g. "0.0.0.0:9000"; unset means no exporter.
    #[serde(default)]
    pub listen_addr: Option<String>,
}

impl AppConfig {
    /// Parse, apply env overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut cfg: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// 1) $DIGEST_CONFIG_PATH
    /// 2) config/digest.toml
    /// 3) built-in defaults (feeds from env only)
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        let default_p = PathBuf::from(DEFAULT_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        tracing::info!("no config file found, using defaults");
        let mut cfg = AppConfig::default();
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// `RSS_FEEDS` / `INITIAL_TUTORIAL_TOPICS` (comma separated) replace the
    /// file values when set and non-empty.
    pub fn apply_env(&mut self) {
        if let Some(feeds) = env_list("RSS_FEEDS") {
            self.ingest.feeds = feeds;
        }
        if let Some(topics) = env_list("INITIAL_TUTORIAL_TOPICS") {
            self.analysis.tutorial_topics = topics;
        }
    }

    pub fn validate(&mut self) -> Result<()> {
        let ing = &mut self.ingest;

        ing.max_age_hours = match &ing.max_hours_since_published {
            None => None,
            Some(v) => {
                match numeric(v).filter(|h| h.is_finite() && *h >= 0.0) {
                    Some(h) => Some(h),
                    None => {
                        tracing::warn!(value = %v, "invalid max_hours_since_published, recency filter off");
                        None
                    }
                }
            }
        };
        ing.limits = FeedLimits::resolve(&ing.feed_limits);

        if ing.max_workers == 0 {
            tracing::warn!("ingest.max_workers = 0, using {}", default_max_workers());
            ing.max_workers = default_max_workers();
        }
        if ing.fetch_timeout_secs == 0 {
            tracing::warn!(
                "ingest.fetch_timeout_secs = 0, using {}",
                default_fetch_timeout_secs()
            );
            ing.fetch_timeout_secs = default_fetch_timeout_secs();
        }
        if ing.user_agent.trim().is_empty() {
            ing.user_agent = default_user_agent();
        }
        if ing.feeds.is_empty() {
            tracing::warn!("no feeds configured");
        }

        if !(0..=MAX_FRESHNESS_SECS).contains(&self.cache.freshness_secs) {
            tracing::warn!(
                value = self.cache.freshness_secs,
                max = MAX_FRESHNESS_SECS,
                "cache.freshness_secs out of range, using {}",
                default_freshness_secs()
            );
            self.cache.freshness_secs = default_freshness_secs();
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.ledger.retention_days) {
            tracing::warn!(
                value = self.ledger.retention_days,
                max = MAX_RETENTION_DAYS,
                "ledger.retention_days out of range, using {}",
                default_retention_days()
            );
            self.ledger.retention_days = default_retention_days();
        }
        if !(1..=MAX_INTERVAL_SECS).contains(&self.schedule.interval_secs) {
            tracing::warn!(
                value = self.schedule.interval_secs,
                max = MAX_INTERVAL_SECS,
                "schedule.interval_secs out of range, using {}",
                default_interval_secs()
            );
            self.schedule.interval_secs = default_interval_secs();
        }

        self.analysis.resolve()?;
        Ok(())
    }

    /// One entry per distinct feed, in configured order.
    pub fn source_configs(&self) -> Vec<SourceConfig> {
        let ing = &self.ingest;
        let skip: HashSet<&str> = ing.skip_feeds.iter().map(|s| s.trim()).collect();
        let mut seen = HashSet::new();
        ing.feeds
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty() && seen.insert(*u))
            .map(|url| SourceConfig {
                url: url.to_string(),
                max_age_hours: ing.max_age_hours,
                cap: Some(ing.limits.for_source(url)),
                skip: skip.contains(url),
            })
            .collect()
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let list: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!list.is_empty()).then_some(list)
}
