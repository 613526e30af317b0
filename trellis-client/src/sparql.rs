//! SPARQL endpoint client.
//!
//! [`SparqlClient`] is the interface the indexing core consumes; the
//! production implementation [`HttpSparqlClient`] speaks the SPARQL 1.1
//! protocol over HTTP with the row-level authorization headers set by
//! the connection pool.
//!
//! Transient failures (network errors, 5xx) are retried with bounded
//! exponential backoff before surfacing; exhausted retries become a
//! task failure for the resource being processed, never a crash.

use crate::error::{ClientError, Result};
use crate::term::{ConstructTriple, SelectResponse};
use async_trait::async_trait;
use std::time::Duration;
use trellis_auth::{AccessScope, ALLOWED_GROUPS_HEADER, SUDO_HEADER};

/// Authorization mode a client is bound to.
#[derive(Debug, Clone)]
pub enum Authorization {
    /// Row-level filtering under the caller's allowed groups.
    Scope(AccessScope),
    /// Privileged access bypassing row-level filtering.
    Sudo,
}

/// Retry behavior for transient endpoint failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// An authorized SPARQL endpoint client.
#[async_trait]
pub trait SparqlClient: Send + Sync {
    /// Execute a SELECT (or ASK) query.
    async fn select(&self, sparql: &str) -> Result<SelectResponse>;

    /// Execute a CONSTRUCT query and return the produced triples.
    async fn construct(&self, sparql: &str) -> Result<Vec<ConstructTriple>>;

    /// Execute a SPARQL UPDATE.
    async fn update(&self, sparql: &str) -> Result<()>;

    /// Execute an ASK query.
    async fn ask(&self, sparql: &str) -> Result<bool> {
        let response = self.select(sparql).await?;
        Ok(response.boolean.unwrap_or(false))
    }
}

/// SPARQL 1.1 protocol client over HTTP.
///
/// Queries are POSTed form-encoded with
/// `Accept: application/sparql-results+json`. CONSTRUCT results are
/// expected as s/p/o rows of the same JSON format, which is how
/// authorization-rewriting endpoints commonly serialize them.
#[derive(Clone)]
pub struct HttpSparqlClient {
    http: reqwest::Client,
    endpoint: String,
    authorization: Authorization,
    retry: RetryPolicy,
}

impl std::fmt::Debug for HttpSparqlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSparqlClient")
            .field("endpoint", &self.endpoint)
            .field("authorization", &self.authorization)
            .finish()
    }
}

impl HttpSparqlClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        authorization: Authorization,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            authorization,
            retry,
        }
    }

    fn apply_authorization(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.authorization {
            Authorization::Scope(scope) => req.header(ALLOWED_GROUPS_HEADER, scope.cache_key()),
            Authorization::Sudo => req.header(SUDO_HEADER, "true"),
        }
    }

    async fn post_form(&self, key: &'static str, sparql: &str) -> Result<reqwest::Response> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.try_post_form(key, sparql).await;
            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    tracing::warn!(
                        target: "sparql",
                        attempt,
                        error = %e,
                        "transient endpoint failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_post_form(&self, key: &'static str, sparql: &str) -> Result<reqwest::Response> {
        let req = self
            .http
            .post(&self.endpoint)
            .header("Accept", "application/sparql-results+json")
            .form(&[(key, sparql)]);
        let response = self.apply_authorization(req).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                service: "sparql",
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl SparqlClient for HttpSparqlClient {
    async fn select(&self, sparql: &str) -> Result<SelectResponse> {
        let response = self.post_form("query", sparql).await?;
        response
            .json::<SelectResponse>()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn construct(&self, sparql: &str) -> Result<Vec<ConstructTriple>> {
        let response = self.select(sparql).await?;
        let mut triples = Vec::with_capacity(response.results.bindings.len());
        for mut row in response.results.bindings {
            let (Some(subject), Some(predicate), Some(object)) =
                (row.remove("s"), row.remove("p"), row.remove("o"))
            else {
                return Err(ClientError::InvalidResponse(
                    "construct row without s/p/o bindings".to_string(),
                ));
            };
            triples.push(ConstructTriple {
                subject,
                predicate,
                object,
            });
        }
        Ok(triples)
    }

    async fn update(&self, sparql: &str) -> Result<()> {
        self.post_form("update", sparql).await?;
        Ok(())
    }
}
