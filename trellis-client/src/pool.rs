//! Authorization-scoped SPARQL connection pool.
//!
//! The pool bounds concurrent endpoint use and hands out clients bound
//! to a specific authorization for the scope of one closure. The permit
//! backing a loan is released when the closure returns, on success and
//! on failure alike, so a crashed batch can never leak capacity.
//!
//! Client construction goes through [`SparqlClientFactory`], which lets
//! tests substitute in-memory endpoints while production uses
//! [`HttpClientFactory`].

use crate::error::Result;
use crate::sparql::{Authorization, HttpSparqlClient, RetryPolicy, SparqlClient};
use crate::term::SelectResponse;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use trellis_auth::AccessScope;

/// Creates endpoint clients bound to an authorization.
pub trait SparqlClientFactory: Send + Sync {
    fn client(&self, authorization: Authorization) -> Arc<dyn SparqlClient>;
}

/// Factory producing [`HttpSparqlClient`]s for one endpoint URL.
pub struct HttpClientFactory {
    http: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for HttpClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientFactory")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl HttpClientFactory {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            endpoint: endpoint.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl SparqlClientFactory for HttpClientFactory {
    fn client(&self, authorization: Authorization) -> Arc<dyn SparqlClient> {
        Arc::new(HttpSparqlClient::new(
            self.http.clone(),
            self.endpoint.clone(),
            authorization,
            self.retry.clone(),
        ))
    }
}

/// Pool of SPARQL endpoint connections.
pub struct SparqlPool {
    factory: Arc<dyn SparqlClientFactory>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for SparqlPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparqlPool")
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

impl SparqlPool {
    /// Create a pool over a client factory with at most
    /// `max_connections` loans in flight.
    pub fn new(factory: Arc<dyn SparqlClientFactory>, max_connections: usize) -> Self {
        Self {
            factory,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }

    /// Convenience constructor for an HTTP endpoint.
    pub fn for_endpoint(endpoint: &str, max_connections: usize) -> Self {
        Self::new(Arc::new(HttpClientFactory::new(endpoint)), max_connections)
    }

    /// Run a closure with a client bound to the caller's allowed
    /// groups. The connection permit is held for exactly the closure's
    /// lifetime.
    pub async fn with_authorization<T, E, F, Fut>(
        &self,
        scope: &AccessScope,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(Arc<dyn SparqlClient>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("connection pool semaphore closed");
        let client = self.factory.client(Authorization::Scope(scope.clone()));
        f(client).await
    }

    /// Run a closure with a privileged client.
    pub async fn with_sudo<T, E, F, Fut>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Arc<dyn SparqlClient>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("connection pool semaphore closed");
        let client = self.factory.client(Authorization::Sudo);
        f(client).await
    }

    /// Privileged SELECT/ASK.
    pub async fn sudo_query(&self, sparql: &str) -> Result<SelectResponse> {
        self.with_sudo(|client| async move { client.select(sparql).await })
            .await
    }

    /// Privileged UPDATE.
    pub async fn sudo_update(&self, sparql: &str) -> Result<()> {
        self.with_sudo(|client| async move { client.update(sparql).await })
            .await
    }
}
