//! Artifact Sources
//!
//! Places the content cache falls back to when a hash is not cached locally.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::StatusCode;
use tracing::debug;

use crate::cache::store::content_hash;

/// A fallback provider of artifact content
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Hint that fetching is cheap enough to skip persisting the content
    fn is_fast(&self) -> bool;

    /// Fetch the content for `hash`, `None` if the source does not have it
    async fn fetch(&self, hash: &str) -> Result<Option<Bytes>>;
}

/// Source backed by a static in-process map
pub struct MemorySource {
    entries: DashMap<String, Bytes>,
    fast: bool,
    fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            fast: false,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Mark the source as fast
    pub fn fast(mut self) -> Self {
        self.fast = true;
        self
    }

    /// Store `content` under its SHA-256 hash and return the hash
    pub fn insert(&self, content: impl Into<Bytes>) -> String {
        let content = content.into();
        let hash = content_hash(&content);
        self.entries.insert(hash.clone(), content);
        hash
    }

    /// Store `content` under an explicit hash
    pub fn insert_with_hash(&self, hash: &str, content: impl Into<Bytes>) {
        self.entries.insert(hash.to_string(), content.into());
    }

    /// Number of fetches served or attempted
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactSource for MemorySource {
    fn is_fast(&self) -> bool {
        self.fast
    }

    async fn fetch(&self, hash: &str) -> Result<Option<Bytes>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.get(hash).map(|e| e.value().clone()))
    }
}

/// Source serving `GET {base_url}/artifacts/{hash}`
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn artifact_url(&self, hash: &str) -> String {
        format!("{}/artifacts/{}", self.base_url, hash)
    }
}

#[async_trait]
impl ArtifactSource for HttpSource {
    fn is_fast(&self) -> bool {
        true
    }

    async fn fetch(&self, hash: &str) -> Result<Option<Bytes>> {
        let url = self.artifact_url(hash);
        debug!(url = %url, "Fetching artifact over HTTP");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = response
            .error_for_status()
            .with_context(|| format!("Artifact server rejected {}", url))?;
        let content = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {}", url))?;
        Ok(Some(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_serves_by_hash() {
        let source = MemorySource::new();
        let hash = source.insert(Bytes::from_static(b"payload"));

        assert_eq!(
            source.fetch(&hash).await.unwrap(),
            Some(Bytes::from_static(b"payload"))
        );
        assert_eq!(source.fetch("unknown").await.unwrap(), None);
        assert_eq!(source.fetch_count(), 2);
    }

    #[test]
    fn test_http_source_url() {
        let source = HttpSource::new("http://artifacts.local/");
        assert_eq!(
            source.artifact_url("ab12"),
            "http://artifacts.local/artifacts/ab12"
        );
    }
}
