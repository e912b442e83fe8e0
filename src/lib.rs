// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod analyze;
pub mod config;
pub mod deliver;
pub mod ingest;
pub mod ledger;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod state;

// ---- Re-exports for stable public API ----
pub use crate::config::AppConfig;
pub use crate::ingest::{
    FeedCache, FeedClient, FeedItem, FetchResult, IngestStats, IngestionOrchestrator, ItemFilter,
    SourceConfig,
};
pub use crate::ledger::{DeduplicationLedger, Ledger};
pub use crate::pipeline::{Pipeline, RunReport};
