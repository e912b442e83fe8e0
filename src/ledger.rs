// src/ledger.rs
//! Durable identity → last-seen ledger gating which items count as new.
//!
//! On disk it is a single JSON object mapping identity to an RFC 3339
//! timestamp. Saves go through a temp file plus rename.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use metrics::{describe_gauge, gauge};
use once_cell::sync::OnceCell;

use crate::ingest::types::FeedItem;

pub const DEFAULT_RETENTION_DAYS: i64 = 7;

pub type Ledger = BTreeMap<String, DateTime<Utc>>;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_gauge!(
            "ledger_entries",
            "Identities held in the dedup ledger after the last save."
        );
    });
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger io: {0}")]
    Io(#[from] io::Error),
    #[error("ledger json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct DeduplicationLedger {
    path: Option<PathBuf>,
    retention: Duration,
}

impl Default for DeduplicationLedger {
    fn default() -> Self {
        Self::in_memory(Duration::days(DEFAULT_RETENTION_DAYS))
    }
}

impl DeduplicationLedger {
    pub fn new(path: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            path: Some(path.into()),
            retention,
        }
    }

    /// No backing file: `load` is always empty and `save` is a no-op.
    pub fn in_memory(retention: Duration) -> Self {
        Self {
            path: None,
            retention,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Never fails: a missing or corrupt file yields an empty ledger.
    pub fn load(&self) -> Ledger {
        match self.try_load() {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "ledger unreadable, starting empty");
                Ledger::new()
            }
        }
    }

    pub fn try_load(&self) -> Result<Ledger, LedgerError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(Ledger::new());
        };
        let raw = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Ledger::new()),
            Err(e) => return Err(e.into()),
        };
        let map: BTreeMap<String, String> = serde_json::from_str(&raw)?;

        let mut out = Ledger::new();
        for (identity, ts) in map {
            match DateTime::parse_from_rfc3339(&ts) {
                Ok(dt) => {
                    out.insert(identity, dt.with_timezone(&Utc));
                }
                Err(_) => {
                    tracing::debug!(identity = %identity, ts = %ts, "skipping ledger entry with bad timestamp");
                }
            }
        }
        Ok(out)
    }

    fn horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Drops entries with `timestamp < now - retention`.
    pub fn prune(&self, ledger: &mut Ledger, now: DateTime<Utc>) {
        let horizon = self.horizon(now);
        ledger.retain(|_, ts| *ts >= horizon);
    }

    /// Splits candidates into `(new, already_seen)`. Items without an identity
    /// cannot be tracked and always count as new.
    pub fn filter_new(
        &self,
        ledger: &Ledger,
        candidates: Vec<FeedItem>,
        now: DateTime<Utc>,
    ) -> (Vec<FeedItem>, Vec<FeedItem>) {
        let horizon = self.horizon(now);
        candidates.into_iter().partition(|it| match it.identity() {
            Some(id) => !ledger.get(id).is_some_and(|ts| *ts >= horizon),
            None => true,
        })
    }

    /// Marks `delivered` as seen at `now`, then prunes.
    pub fn record(&self, ledger: &mut Ledger, delivered: &[FeedItem], now: DateTime<Utc>) {
        for id in delivered.iter().filter_map(FeedItem::identity) {
            ledger.insert(id.to_string(), now);
        }
        self.prune(ledger, now);
    }

    /// Prunes, then writes atomically. Without a path this only prunes.
    pub fn save(&self, ledger: &mut Ledger, now: DateTime<Utc>) -> Result<(), LedgerError> {
        ensure_metrics_described();
        self.prune(ledger, now);
        gauge!("ledger_entries").set(ledger.len() as f64);

        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let on_disk: BTreeMap<&str, String> = ledger
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_rfc3339_opts(SecondsFormat::Secs, true)))
            .collect();
        let json = serde_json::to_string_pretty(&on_disk)?;

        let tmp = path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp)?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
