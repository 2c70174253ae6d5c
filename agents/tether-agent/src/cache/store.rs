//! Content Cache
//!
//! Directory of artifact files named by their SHA-256 content hash. Lookups
//! are cache-first; on a miss the configured sources are consulted in order.
//! Content from slow sources is persisted so the next lookup is local.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::source::ArtifactSource;

/// Lowercase hex SHA-256 of `content`
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Content-addressed artifact cache
pub struct ContentCache {
    root: PathBuf,
    sources: Vec<Arc<dyn ArtifactSource>>,
}

impl ContentCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            sources: Vec::new(),
        }
    }

    /// Add a fallback source, consulted after the ones added before it
    pub fn with_source(mut self, source: Arc<dyn ArtifactSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `hash` is present in the local directory
    pub fn contains(&self, hash: &str) -> bool {
        Self::validate(hash).is_ok() && self.root.join(hash).is_file()
    }

    /// Resolve `hash` to its content, `None` when neither the cache nor any
    /// source has it
    pub async fn fetch(&self, hash: &str) -> Result<Option<Bytes>> {
        Self::validate(hash)?;

        let path = self.root.join(hash);
        if path.is_file() {
            let content = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read cached artifact {}", path.display()))?;
            debug!(hash = %hash, "Artifact served from cache");
            return Ok(Some(Bytes::from(content)));
        }

        for source in &self.sources {
            let content = match source.fetch(hash).await {
                Ok(Some(content)) => content,
                Ok(None) => continue,
                Err(e) => {
                    warn!(hash = %hash, error = %e, "Artifact source failed");
                    continue;
                }
            };

            let actual = content_hash(&content);
            if !actual.eq_ignore_ascii_case(hash) {
                warn!(hash = %hash, actual = %actual, "Artifact digest mismatch, ignoring source");
                continue;
            }

            if source.is_fast() {
                return Ok(Some(content));
            }

            self.persist(hash, &content).await?;
            return Ok(Some(content));
        }

        Ok(None)
    }

    async fn persist(&self, hash: &str, content: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create cache dir {}", self.root.display()))?;

        let tmp = self.root.join(format!(".{}.{}.tmp", hash, Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, self.root.join(hash))
            .await
            .with_context(|| format!("Failed to move {} into cache", tmp.display()))?;

        info!(hash = %hash, size = content.len(), "Artifact cached");
        Ok(())
    }

    /// Hashes are used as file names, so only plain hex-like names are allowed
    fn validate(hash: &str) -> Result<()> {
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
            bail!("Invalid content hash {:?}", hash);
        }
        Ok(())
    }
}
