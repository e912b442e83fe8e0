// src/ingest/mod.rs
pub mod cache;
pub mod client;
pub mod filter;
pub mod orchestrator;
pub mod parser;
pub mod types;

pub use cache::{CacheEntry, FeedCache};
pub use client::HttpFeedClient;
pub use filter::{FilterOutcome, ItemFilter};
pub use orchestrator::{
    IngestStats, IngestionOrchestrator, MergeOrder, OrchestratorConfig, SourceOutcome,
    SourceReport,
};
pub use types::{FeedClient, FeedItem, FetchError, FetchResult, SourceConfig, Validator};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

const MAX_TEXT_CHARS: usize = 4000;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_fetch_total",
            "Source fetch attempts, labelled by outcome."
        );
        describe_counter!(
            "ingest_items_fetched_total",
            "Raw items obtained from sources (network or cache)."
        );
        describe_counter!(
            "ingest_dropped_total",
            "Items dropped, labelled by filter stage."
        );
        describe_counter!(
            "ingest_sources_skipped_total",
            "Sources excluded by the skip list."
        );
        describe_counter!(
            "ingest_new_items_total",
            "Items not seen within the retention window."
        );
        describe_histogram!("ingest_fetch_ms", "Per-source fetch time in milliseconds.");
        describe_gauge!(
            "ingest_pipeline_last_run_ts",
            "Unix ts when the ingest run last finished."
        );
    });
}

/// Normalize feed text: decode entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| {
        regex::Regex::new(r"(?is)<script.*?</script>|<style.*?</style>|</?[^>]+>")
            .expect("static tag regex")
    });
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").expect("static ws regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) No space before punctuation left behind by stripped inline tags
    static RE_PUNCT: OnceCell<regex::Regex> = OnceCell::new();
    let re_punct =
        RE_PUNCT.get_or_init(|| regex::Regex::new(r" ([.,;:!?])").expect("static punct regex"));
    out = re_punct.replace_all(&out, "$1").to_string();

    // 6) Length cap
    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }

    out
}
