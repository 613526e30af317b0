//! Content-addressed cache for extracted attachment text.
//!
//! Extraction is expensive and attachments rarely change, so extracted
//! text is cached on disk keyed by the SHA-256 of the file contents. A
//! re-upload of identical bytes is a cache hit regardless of file name
//! or location.

use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// On-disk cache of extracted text, keyed by content hash.
#[derive(Debug, Clone)]
pub struct AttachmentCache {
    dir: PathBuf,
}

impl AttachmentCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache key for file contents: lowercase hex SHA-256.
    pub fn key_for(blob: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(blob);
        format!("{:x}", hasher.finalize())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Look up cached text for a key.
    pub async fn get(&self, key: &str) -> Option<String> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(target: "tika", key, error = %e, "attachment cache read failed");
                None
            }
        }
    }

    /// Store extracted text under a key. Failures are logged; the cache
    /// is an optimization, not a source of truth.
    pub async fn put(&self, key: &str, text: &str) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            tracing::warn!(target: "tika", error = %e, "attachment cache directory unavailable");
            return;
        }
        if let Err(e) = tokio::fs::write(self.path_for(key), text).await {
            tracing::warn!(target: "tika", key, error = %e, "attachment cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_hex_sha256() {
        let key = AttachmentCache::key_for(b"hello");
        assert_eq!(key.len(), 64);
        assert_eq!(key, AttachmentCache::key_for(b"hello"));
        assert_ne!(key, AttachmentCache::key_for(b"other"));
    }

    #[tokio::test]
    async fn round_trips_text() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AttachmentCache::new(dir.path());
        let key = AttachmentCache::key_for(b"some file");

        assert_eq!(cache.get(&key).await, None);
        cache.put(&key, "extracted text").await;
        assert_eq!(cache.get(&key).await.as_deref(), Some("extracted text"));
    }
}
