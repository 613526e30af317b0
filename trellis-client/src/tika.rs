//! Text extraction collaborator.
//!
//! Attachment indexing hands file contents to an extraction service and
//! stores the returned plain text. Extraction is best-effort by
//! contract: an empty result or a service failure yields `None` and the
//! document's content field becomes null.

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Extracts plain text from binary file contents.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract text from `blob`. `path` identifies the source file for
    /// diagnostics. Returns `None` when nothing could be extracted.
    async fn extract_text(&self, path: &Path, blob: &[u8]) -> Result<Option<String>>;
}

/// Client for an Apache Tika compatible extraction service.
#[derive(Clone)]
pub struct TikaExtractor {
    http: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for TikaExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TikaExtractor")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl TikaExtractor {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TextExtractor for TikaExtractor {
    async fn extract_text(&self, path: &Path, blob: &[u8]) -> Result<Option<String>> {
        let result = self
            .http
            .put(format!("{}/tika", self.base_url))
            .header("Content-Type", "application/octet-stream")
            .header("Accept", "text/plain")
            .body(blob.to_vec())
            .send()
            .await;

        let response = match result {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::warn!(
                    target: "tika",
                    path = %path.display(),
                    status = response.status().as_u16(),
                    "text extraction failed"
                );
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(target: "tika", path = %path.display(), error = %e, "text extraction unreachable");
                return Ok(None);
            }
        };

        let text = response.text().await.unwrap_or_default();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(trimmed.to_string()))
        }
    }
}
