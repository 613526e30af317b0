//! Search backend client (Elasticsearch-compatible).
//!
//! [`SearchClient`] is the interface the indexing core consumes; the
//! production implementation [`ElasticClient`] speaks the REST API over
//! reqwest. Index names are the MD5-derived names computed by
//! `trellis_auth::index_name`, so they are always URL-safe.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// One operation of a bulk request.
#[derive(Debug, Clone)]
pub enum BulkOperation {
    /// Index (create or replace) a document under an id.
    Index { id: String, document: Value },
    /// Delete a document by id.
    Delete { id: String },
}

/// Search backend operations used by the indexing core.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn create_index(
        &self,
        name: &str,
        mappings: Option<&Value>,
        settings: Option<&Value>,
    ) -> Result<()>;

    async fn index_exists(&self, name: &str) -> Result<bool>;

    async fn delete_index(&self, name: &str) -> Result<()>;

    /// Remove every document while keeping the index and its mapping.
    async fn clear_index(&self, name: &str) -> Result<()>;

    async fn refresh_index(&self, name: &str) -> Result<()>;

    async fn insert_document(&self, index: &str, id: &str, document: &Value) -> Result<()>;

    /// Create the document or merge into an existing one.
    async fn upsert_document(&self, index: &str, id: &str, document: &Value) -> Result<()>;

    /// Delete a document; deleting a missing document is not an error.
    async fn delete_document(&self, index: &str, id: &str) -> Result<()>;

    async fn bulk(&self, index: &str, operations: &[BulkOperation]) -> Result<()>;

    async fn search(&self, index: &str, query: &Value) -> Result<Value>;

    async fn count(&self, index: &str, query: &Value) -> Result<u64>;

    /// Index a document through an ingest pipeline (attachment
    /// processing).
    async fn upload_attachment(
        &self,
        index: &str,
        id: &str,
        pipeline: &str,
        document: &Value,
    ) -> Result<()>;
}

/// REST client for an Elasticsearch-compatible backend.
#[derive(Clone)]
pub struct ElasticClient {
    http: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for ElasticClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ElasticClient {
    /// Create a client for the backend at `base_url`. Trailing slashes
    /// are stripped.
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ClientError::Status {
                service: "search backend",
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl SearchClient for ElasticClient {
    async fn create_index(
        &self,
        name: &str,
        mappings: Option<&Value>,
        settings: Option<&Value>,
    ) -> Result<()> {
        let mut body = serde_json::Map::new();
        if let Some(mappings) = mappings {
            body.insert("mappings".to_string(), mappings.clone());
        }
        if let Some(settings) = settings {
            body.insert("settings".to_string(), settings.clone());
        }
        let response = self
            .http
            .put(self.url(name))
            .json(&Value::Object(body))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn index_exists(&self, name: &str) -> Result<bool> {
        let response = self.http.head(self.url(name)).send().await?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(ClientError::Status {
                service: "search backend",
                status,
                body: String::new(),
            }),
        }
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        let response = self.http.delete(self.url(name)).send().await?;
        // Deleting an index that is already gone is fine.
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn clear_index(&self, name: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("{name}/_delete_by_query?conflicts=proceed&refresh=true")))
            .json(&json!({"query": {"match_all": {}}}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn refresh_index(&self, name: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("{name}/_refresh")))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn insert_document(&self, index: &str, id: &str, document: &Value) -> Result<()> {
        let response = self
            .http
            .put(self.url(&format!("{index}/_doc/{id}")))
            .json(document)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn upsert_document(&self, index: &str, id: &str, document: &Value) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("{index}/_update/{id}")))
            .json(&json!({"doc": document, "doc_as_upsert": true}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("{index}/_doc/{id}")))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn bulk(&self, index: &str, operations: &[BulkOperation]) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for op in operations {
            match op {
                BulkOperation::Index { id, document } => {
                    body.push_str(&json!({"index": {"_id": id}}).to_string());
                    body.push('\n');
                    body.push_str(&document.to_string());
                    body.push('\n');
                }
                BulkOperation::Delete { id } => {
                    body.push_str(&json!({"delete": {"_id": id}}).to_string());
                    body.push('\n');
                }
            }
        }
        let response = self
            .http
            .post(self.url(&format!("{index}/_bulk")))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let response = Self::check(response).await?;

        // Item-level failures are tolerated: log and continue, matching
        // the per-document error policy of the indexing pipeline.
        let report: Value = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        if report.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            let failed = report
                .get("items")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter(|item| {
                            item.as_object()
                                .and_then(|o| o.values().next())
                                .and_then(|v| v.get("error"))
                                .is_some()
                        })
                        .count()
                })
                .unwrap_or(0);
            tracing::warn!(target: "indexing", index, failed, "bulk request had item failures");
        }
        Ok(())
    }

    async fn search(&self, index: &str, query: &Value) -> Result<Value> {
        let response = self
            .http
            .post(self.url(&format!("{index}/_search")))
            .json(query)
            .send()
            .await?;
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn count(&self, index: &str, query: &Value) -> Result<u64> {
        let response = self
            .http
            .post(self.url(&format!("{index}/_count")))
            .json(query)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        body.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| ClientError::InvalidResponse("count response without count".to_string()))
    }

    async fn upload_attachment(
        &self,
        index: &str,
        id: &str,
        pipeline: &str,
        document: &Value,
    ) -> Result<()> {
        let response = self
            .http
            .put(self.url(&format!("{index}/_doc/{id}?pipeline={pipeline}")))
            .json(document)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
