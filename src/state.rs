// src/state.rs
//! Small persisted run state: source health counters and the tutorial topic
//! cursor. Loaded at the start of a run and saved at the end.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ingest::IngestStats;

pub const DEFAULT_STATE_PATH: &str = "state/run_state.json";
pub const DEFAULT_EMPTY_RUN_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub source_health: SourceHealth,
    #[serde(default)]
    pub topic_cursor: TopicCursor,
}

impl RunState {
    /// Missing or corrupt state starts fresh.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "run state corrupt, starting fresh");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("serializing run state")?;
        let tmp = path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(json.as_bytes())?;
        fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

/// Consecutive zero-item runs per source. Sources are only reported, never
/// disabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceHealth {
    empty_runs: BTreeMap<String, u32>,
}

impl SourceHealth {
    pub fn empty_runs(&self, source_id: &str) -> u32 {
        self.empty_runs.get(source_id).copied().unwrap_or(0)
    }

    /// Updates counters from one run; returns sources at or over `threshold`.
    /// Skipped sources are left untouched.
    pub fn observe(&mut self, stats: &IngestStats, threshold: u32) -> Vec<String> {
        let mut flagged = Vec::new();
        for s in &stats.sources {
            if s.fetched > 0 {
                self.empty_runs.remove(&s.source_id);
                continue;
            }
            let n = self.empty_runs.entry(s.source_id.clone()).or_insert(0);
            *n = n.saturating_add(1);
            if threshold > 0 && *n >= threshold {
                flagged.push(s.source_id.clone());
            }
        }
        flagged
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCursor {
    next: usize,
}

impl TopicCursor {
    /// Returns the current topic and moves to the next one (wrapping).
    pub fn advance(&mut self, topics: &[String]) -> Option<String> {
        if topics.is_empty() {
            return None;
        }
        let idx = self.next % topics.len();
        self.next = (idx + 1) % topics.len();
        Some(topics[idx].clone())
    }

    pub fn peek<'a>(&self, topics: &'a [String]) -> Option<&'a str> {
        if topics.is_empty() {
            None
        } else {
            Some(topics[self.next % topics.len()].as_str())
        }
    }
}
