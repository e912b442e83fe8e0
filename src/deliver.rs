// src/deliver.rs
//! Digest assembly output and the delivery seam.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::analyze::{Analysis, GeneratedTutorial};
use crate::ingest::FeedItem;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub item: FeedItem,
    pub analysis: Analysis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub subject: String,
    pub generated_at: DateTime<Utc>,
    pub news: Vec<DigestEntry>,
    pub tutorials: Vec<DigestEntry>,
    /// Written for the next rotation topic; absent when generation failed
    /// or analysis is off.
    #[serde(default)]
    pub generated_tutorial: Option<GeneratedTutorial>,
}

impl Digest {
    pub fn new(subject_prefix: &str, generated_at: DateTime<Utc>) -> Self {
        Self {
            subject: format!(
                "{} AI Daily Digest - {}",
                subject_prefix.trim(),
                generated_at.format("%Y-%m-%d")
            )
            .trim()
            .to_string(),
            generated_at,
            news: Vec::new(),
            tutorials: Vec::new(),
            generated_tutorial: None,
        }
    }

    /// Every item included, news first.
    pub fn items(&self) -> Vec<FeedItem> {
        self.news
            .iter()
            .chain(&self.tutorials)
            .map(|e| e.item.clone())
            .collect()
    }

    pub fn tutorial_topic(&self) -> Option<&str> {
        self.generated_tutorial.as_ref().map(|t| t.topic.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.news.is_empty() && self.tutorials.is_empty()
    }
}

#[async_trait]
pub trait DigestSink: Send + Sync {
    /// `Ok` means the digest reached its destination.
    async fn deliver(&self, digest: &Digest) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Writes `digest_YYYYMMDD_HHMMSS.json` into a directory.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        self.dir.join(format!(
            "digest_{}.json",
            digest.generated_at.format("%Y%m%d_%H%M%S")
        ))
    }
}

#[async_trait]
impl DigestSink for FileSink {
    async fn deliver(&self, digest: &Digest) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path_for(digest);
        let json = serde_json::to_string_pretty(digest).context("serializing digest")?;
        let tmp = path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp)
            .await
            .with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(json.as_bytes()).await?;
        f.sync_all().await?;
        drop(f);
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), items = digest.items().len(), "digest written");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Logs a one-line entry per item. Always succeeds.
pub struct LogSink;

#[async_trait]
impl DigestSink for LogSink {
    async fn deliver(&self, digest: &Digest) -> Result<()> {
        tracing::info!(subject = %digest.subject, topic = ?digest.tutorial_topic(), "digest");
        if let Some(t) = &digest.generated_tutorial {
            tracing::info!(topic = %t.topic, chars = t.markdown.chars().count(), "generated tutorial");
        }
        for (section, entries) in [("news", &digest.news), ("tutorial", &digest.tutorials)] {
            for e in entries {
                tracing::info!(
                    section,
                    relevance = e.analysis.relevance,
                    title = %e.item.title,
                    link = %e.item.link,
                    "digest item"
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
