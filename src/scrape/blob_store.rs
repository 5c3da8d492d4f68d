//! Append-only raw artifact sink.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Contract: write text under a key, return the key. Keys use path segments
/// `{job_id}/{dealer_id}_{epoch_ms}.{suffix}` so concurrent tasks never
/// collide.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_text(&self, key: &str, content: &str) -> Result<String>;
}

/// Filesystem-backed blob store for raw scrape captures.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBlobStore { root: root.into() }
    }

    pub fn build_key(job_id: &str, dealer_id: i64, suffix: &str) -> String {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        format!("{job_id}/{dealer_id}_{epoch_ms}.{suffix}")
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put_text(&self, key: &str, content: &str) -> Result<String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating blob dir {}", parent.display()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("writing blob {}", path.display()))?;
        Ok(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_blob_under_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let key = LocalBlobStore::build_key("job-1", 42, "md");
        assert!(key.starts_with("job-1/42_"));
        assert!(key.ends_with(".md"));

        let stored = store.put_text(&key, "# inventory").await.unwrap();
        assert_eq!(stored, key);
        let content = std::fs::read_to_string(dir.path().join(&key)).unwrap();
        assert_eq!(content, "# inventory");
    }
}
