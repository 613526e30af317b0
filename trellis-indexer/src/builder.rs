//! Bulk index building.
//!
//! Rebuilds one search index from scratch: counts the resources of the
//! configured rdf:types visible under the index's authorization,
//! partitions them into batches, and processes batches in parallel.
//! Each batch borrows one authorized client from the connection pool
//! for its whole lifetime, builds the documents and ships them in a
//! single bulk request. A failing document is logged and skipped; the
//! batch continues.

use crate::document::{document_id, DocumentBuilder};
use crate::error::{IndexerError, Result};
use crate::index::SearchIndex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use trellis_client::{BulkOperation, SearchClient, SparqlPool, TermKind};
use trellis_config::{Configuration, IndexDefinition};

/// Bulk indexer for single indexes.
pub struct IndexBuilder {
    config: Arc<Configuration>,
    pool: Arc<SparqlPool>,
    search: Arc<dyn SearchClient>,
    documents: Arc<DocumentBuilder>,
}

impl IndexBuilder {
    pub fn new(
        config: Arc<Configuration>,
        pool: Arc<SparqlPool>,
        search: Arc<dyn SearchClient>,
        documents: Arc<DocumentBuilder>,
    ) -> Self {
        Self {
            config,
            pool,
            search,
            documents,
        }
    }

    /// Rebuild the contents of `index`. Returns the number of documents
    /// indexed.
    pub async fn build(&self, index: &SearchIndex) -> Result<u64> {
        let definition = self
            .config
            .definition(index.type_name())
            .ok_or_else(|| IndexerError::UnknownType(index.type_name().to_string()))?;
        let type_filter = type_filter(definition);

        let total = self.count_resources(index, &type_filter).await?;
        let batch_size = self.config.settings.batch_size as u64;
        let mut full_batches = total / batch_size;
        if self.config.settings.max_batches > 0 {
            full_batches = full_batches.min(self.config.settings.max_batches as u64);
        }
        // The trailing remainder batch is processed regardless of the
        // cap.
        let remainder = total % batch_size;
        let mut slices: Vec<(u64, u64)> = (0..full_batches)
            .map(|batch| (batch * batch_size, batch_size))
            .collect();
        if remainder > 0 {
            slices.push((full_batches * batch_size, remainder));
        }

        tracing::info!(
            target: "indexing",
            index = index.name(),
            r#type = index.type_name(),
            total,
            batches = slices.len(),
            "bulk indexing"
        );

        let workers = Arc::new(Semaphore::new(self.config.settings.number_of_threads));
        let tasks = slices.into_iter().map(|(offset, limit)| {
            let workers = Arc::clone(&workers);
            let type_filter = type_filter.clone();
            async move {
                let _permit = workers
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");
                self.build_batch(index, definition, &type_filter, offset, limit)
                    .await
            }
        });

        let mut indexed = 0;
        for result in futures::future::join_all(tasks).await {
            match result {
                Ok(count) => indexed += count,
                Err(e) => {
                    tracing::warn!(
                        target: "indexing",
                        index = index.name(),
                        error = %e,
                        "batch failed"
                    );
                }
            }
        }
        Ok(indexed)
    }

    async fn count_resources(&self, index: &SearchIndex, type_filter: &str) -> Result<u64> {
        let query = format!(
            "SELECT (COUNT(DISTINCT ?s) AS ?count) WHERE {{\n\
             \u{20} ?s a ?type .\n\
             \u{20} FILTER(?type IN ({type_filter}))\n\
             }}"
        );
        self.pool
            .with_authorization(index.allowed_groups(), |client| async move {
                let response = client.select(&query).await?;
                let count = response
                    .column("count")
                    .next()
                    .and_then(|t| t.value.parse().ok())
                    .unwrap_or(0);
                Ok(count)
            })
            .await
    }

    async fn build_batch(
        &self,
        index: &SearchIndex,
        definition: &IndexDefinition,
        type_filter: &str,
        offset: u64,
        limit: u64,
    ) -> Result<u64> {
        self.pool
            .with_authorization(index.allowed_groups(), |client| async move {
                let query = format!(
                    "SELECT DISTINCT ?s WHERE {{\n\
                     \u{20} ?s a ?type .\n\
                     \u{20} FILTER(?type IN ({type_filter}))\n\
                     }} ORDER BY ?s LIMIT {limit} OFFSET {offset}"
                );
                let response = client.select(&query).await?;

                let mut operations = Vec::new();
                for term in response.column("s") {
                    if term.kind != TermKind::Uri {
                        continue;
                    }
                    let operation = self
                        .documents
                        .build(client.as_ref(), &term.value, definition)
                        .await
                        .and_then(|document| match document_id(&document).map(str::to_string) {
                            Some(id) => Ok(BulkOperation::Index { id, document }),
                            None => Err(IndexerError::MissingUuid(term.value.clone())),
                        });
                    match operation {
                        Ok(operation) => operations.push(operation),
                        Err(e) => {
                            tracing::warn!(
                                target: "indexing",
                                subject = %term.value,
                                error = %e,
                                "skipping document that failed to build"
                            );
                        }
                    }
                }

                let indexed = operations.len() as u64;
                self.search.bulk(index.name(), &operations).await?;
                Ok(indexed)
            })
            .await
    }
}

/// Comma-separated IRI list for a FILTER(?type IN (...)) clause.
pub(crate) fn type_filter(definition: &IndexDefinition) -> String {
    definition
        .related_rdf_types()
        .iter()
        .map(|t| format!("<{t}>"))
        .collect::<Vec<_>>()
        .join(", ")
}
