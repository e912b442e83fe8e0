// src/ingest/client.rs
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::histogram;
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;

use crate::ingest::parser::parse_feed;
use crate::ingest::types::{FeedClient, FetchError, FetchResult, Validator};

pub const DEFAULT_USER_AGENT: &str = concat!("feed-digest/", env!("CARGO_PKG_VERSION"));

/// reqwest-backed [`FeedClient`] with conditional GET.
#[derive(Debug, Clone)]
pub struct HttpFeedClient {
    client: reqwest::Client,
}

impl HttpFeedClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("building feed http client")?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_inner(
        &self,
        url: &str,
        validator: Option<&Validator>,
    ) -> Result<FetchResult, FetchError> {
        let mut req = self.client.get(url);
        if let Some(v) = validator {
            if let Some(etag) = v.etag.as_deref() {
                req = req.header(IF_NONE_MATCH, etag);
            }
            if let Some(m) = v.last_modified.as_deref() {
                req = req.header(IF_MODIFIED_SINCE, m);
            }
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchResult::NotModified);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let header = |name: HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let new_validator = Validator {
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
        };

        let body = resp.text().await?;
        let parsed = parse_feed(&body, url);
        if parsed.is_unusable() {
            let reason = parsed
                .error
                .unwrap_or_else(|| "no rss/atom root element".to_string());
            return Err(FetchError::Parse(reason));
        }
        if let Some(err) = parsed.error.as_deref() {
            tracing::warn!(
                source = %url,
                error = %err,
                kept = parsed.items.len(),
                "malformed feed, keeping entries parsed before the error"
            );
        }

        Ok(FetchResult::Success {
            items: parsed.items,
            validator: Some(new_validator).filter(|v| !v.is_empty()),
        })
    }
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    async fn fetch(&self, source_url: &str, validator: Option<&Validator>) -> FetchResult {
        let t0 = Instant::now();
        let out = match self.fetch_inner(source_url, validator).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(source = %source_url, error = %e, "feed fetch failed");
                FetchResult::Failure(e)
            }
        };
        histogram!("ingest_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        out
    }
}
