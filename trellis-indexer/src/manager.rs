//! Index lifecycle management.
//!
//! The index manager is the central coordination point of the control
//! plane. It owns the registry of live indexes, ensures indexes exist
//! for authorization scopes, combines eager indexes to cover a caller's
//! groups, and drives rebuilds.
//!
//! No error escapes the public operations: every call returns a
//! [`SearchIndex`] (possibly with status `Invalid`) or a list thereof,
//! and failures are logged under the `index_mgmt` target. Searches can
//! then proceed on stale data rather than failing outright.

use crate::builder::IndexBuilder;
use crate::document::DocumentBuilder;
use crate::index::{IndexStatus, SearchIndex};
use crate::metadata;
use crate::registry::SearchIndexRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use trellis_auth::{covers, AccessScope};
use trellis_client::{SearchClient, SparqlPool};
use trellis_config::{Configuration, IndexDefinition};

/// Coordinates index existence, freshness and removal.
pub struct IndexManager {
    config: Arc<Configuration>,
    pool: Arc<SparqlPool>,
    search: Arc<dyn SearchClient>,
    documents: Arc<DocumentBuilder>,
    registry: SearchIndexRegistry,
    builder: IndexBuilder,
}

impl IndexManager {
    pub fn new(
        config: Arc<Configuration>,
        pool: Arc<SparqlPool>,
        search: Arc<dyn SearchClient>,
        documents: Arc<DocumentBuilder>,
    ) -> Arc<Self> {
        let builder = IndexBuilder::new(
            Arc::clone(&config),
            Arc::clone(&pool),
            Arc::clone(&search),
            Arc::clone(&documents),
        );
        Arc::new(Self {
            config,
            pool,
            search,
            documents,
            registry: SearchIndexRegistry::new(),
            builder,
        })
    }

    pub fn config(&self) -> &Arc<Configuration> {
        &self.config
    }

    pub fn pool(&self) -> &Arc<SparqlPool> {
        &self.pool
    }

    pub fn search(&self) -> &Arc<dyn SearchClient> {
        &self.search
    }

    pub fn documents(&self) -> &Arc<DocumentBuilder> {
        &self.documents
    }

    pub fn registry(&self) -> &SearchIndexRegistry {
        &self.registry
    }

    /// Reconcile startup state and pre-build the eager indexes.
    ///
    /// With `persist_indexes` the metadata graph repopulates the
    /// registry (statuses are tentative until the backend existence
    /// check in `ensure_index` corrects them); without it, every
    /// persisted index and its backend counterpart is removed.
    /// Eager group tuples are then ensured and bulk-indexed
    /// synchronously, deliberately before any request is served.
    pub async fn initialize(&self) {
        if self.config.settings.persist_indexes {
            self.restore_persisted().await;
        } else {
            self.purge_persisted().await;
        }

        let eager_scopes = self.config.settings.eager_indexing_groups.clone();
        let type_names: Vec<String> = self.config.type_names().map(String::from).collect();
        for scope in &eager_scopes {
            for type_name in &type_names {
                let index = self.ensure_index(type_name, scope, scope, true).await;
                if index.status() == IndexStatus::Invalid {
                    self.update_index(&index).await;
                }
            }
        }
    }

    async fn restore_persisted(&self) {
        for type_name in self.config.type_names() {
            let persisted = match metadata::load_indexes_for_type(&self.pool, type_name).await {
                Ok(persisted) => persisted,
                Err(e) => {
                    tracing::warn!(
                        target: "index_mgmt",
                        r#type = type_name,
                        error = %e,
                        "could not load persisted indexes"
                    );
                    continue;
                }
            };
            for entry in persisted {
                let is_eager = self
                    .config
                    .settings
                    .eager_indexing_groups
                    .contains(&entry.allowed_groups);
                let index = SearchIndex::new(
                    entry.type_name,
                    entry.allowed_groups,
                    entry.used_groups,
                    is_eager,
                    IndexStatus::Valid,
                );
                if index.name() != entry.name {
                    tracing::warn!(
                        target: "index_mgmt",
                        persisted = %entry.name,
                        computed = index.name(),
                        "persisted index name does not match its identity; dropping entry"
                    );
                    continue;
                }
                self.registry.insert(Arc::new(index));
            }
        }
    }

    async fn purge_persisted(&self) {
        let names = match metadata::load_all_index_names(&self.pool).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(target: "index_mgmt", error = %e, "could not enumerate persisted indexes");
                return;
            }
        };
        // Backend first, metadata second: metadata is the record of
        // existence and must outlive the backend indexes.
        for name in names {
            if let Err(e) = self.search.delete_index(&name).await {
                tracing::warn!(target: "index_mgmt", index = %name, error = %e, "could not delete backend index");
            }
        }
        if let Err(e) = metadata::remove_all_metadata(&self.pool).await {
            tracing::warn!(target: "index_mgmt", error = %e, "could not delete index metadata");
        }
    }

    /// Ensure an index exists for an identity and return it.
    ///
    /// Upserts the metadata, registers the in-memory entry, and creates
    /// the backend index with the computed mapping when missing (the
    /// fresh index starts `Invalid` so the next fetch rebuilds it).
    pub async fn ensure_index(
        &self,
        type_name: &str,
        allowed_groups: &AccessScope,
        used_groups: &AccessScope,
        is_eager: bool,
    ) -> Arc<SearchIndex> {
        let allowed = self.config.effective_scope(allowed_groups);
        let used = self.config.effective_scope(used_groups);
        let key = allowed.cache_key();

        let (index, created) = self.registry.get_or_insert_with(type_name, &key, || {
            SearchIndex::new(type_name, allowed.clone(), used, is_eager, IndexStatus::Valid)
        });
        if created {
            tracing::info!(
                target: "index_mgmt",
                r#type = type_name,
                index = index.name(),
                groups = %key,
                "registered index"
            );
        }

        if let Err(e) = metadata::persist_index(&self.pool, &index).await {
            tracing::warn!(
                target: "index_mgmt",
                index = index.name(),
                error = %e,
                "could not persist index metadata"
            );
        }

        match self.search.index_exists(index.name()).await {
            Ok(true) => {}
            Ok(false) => {
                let Some(definition) = self.config.definition(type_name) else {
                    tracing::warn!(target: "index_mgmt", r#type = type_name, "no definition for index type");
                    index.mark_invalid();
                    return index;
                };
                let mappings = index_mappings(definition);
                let settings = definition
                    .settings
                    .clone()
                    .or_else(|| self.config.settings.default_settings.clone());
                match self
                    .search
                    .create_index(index.name(), Some(&mappings), settings.as_ref())
                    .await
                {
                    Ok(()) => index.mark_invalid(),
                    Err(e) => {
                        tracing::warn!(
                            target: "index_mgmt",
                            index = index.name(),
                            error = %e,
                            "could not create backend index"
                        );
                        index.mark_invalid();
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "index_mgmt",
                    index = index.name(),
                    error = %e,
                    "backend existence check failed"
                );
                index.mark_invalid();
            }
        }

        index
    }

    /// Select the indexes answering a request.
    ///
    /// Without an authorization scope every index of the selected types
    /// is returned (privileged management paths). With a scope, eager
    /// indexes whose groups are a subset of the caller's are reduced to
    /// a minimal cover; if they jointly cover the caller, they are the
    /// answer, otherwise a single exact-match index is ensured.
    ///
    /// Invalid indexes are updated before returning. Indexes that stay
    /// invalid are still returned so searches proceed on stale data.
    pub async fn fetch_indexes(
        &self,
        type_name: Option<&str>,
        allowed_groups: Option<&AccessScope>,
        force_update: bool,
    ) -> Vec<Arc<SearchIndex>> {
        let type_names: Vec<String> = match type_name {
            Some(name) => vec![name.to_string()],
            None => self.config.type_names().map(String::from).collect(),
        };

        let mut selected: Vec<Arc<SearchIndex>> = Vec::new();
        match allowed_groups {
            None => {
                for name in &type_names {
                    selected.extend(self.registry.find_for_type(name));
                }
            }
            Some(scope) => {
                let effective = self.config.effective_scope(scope);
                for name in &type_names {
                    selected.extend(self.select_for_scope(name, &effective).await);
                }
            }
        }

        if force_update {
            for index in &selected {
                index.mark_invalid();
            }
        }

        for index in &selected {
            if index.status() == IndexStatus::Invalid {
                self.update_index(index).await;
            }
        }
        for index in &selected {
            if index.status() == IndexStatus::Invalid {
                tracing::warn!(
                    target: "index_mgmt",
                    index = index.name(),
                    "index still invalid after update; serving stale data"
                );
            }
        }

        selected
    }

    /// Pick the eager cover for one type, or ensure an exact index.
    async fn select_for_scope(
        &self,
        type_name: &str,
        effective: &AccessScope,
    ) -> Vec<Arc<SearchIndex>> {
        let candidates: Vec<Arc<SearchIndex>> = self
            .registry
            .find_for_type(type_name)
            .into_iter()
            .filter(|index| {
                index.is_eager()
                    && index.status() != IndexStatus::Deleted
                    && index.allowed_groups().is_subset_of(effective)
            })
            .collect();

        // Minimal cover: an index strictly contained in another
        // retained index contributes nothing.
        let retained: Vec<Arc<SearchIndex>> = candidates
            .iter()
            .filter(|index| {
                !candidates.iter().any(|other| {
                    !Arc::ptr_eq(index, other)
                        && index
                            .allowed_groups()
                            .is_strict_subset_of(other.allowed_groups())
                })
            })
            .cloned()
            .collect();

        let scopes: Vec<&AccessScope> = retained.iter().map(|i| i.allowed_groups()).collect();
        if !retained.is_empty() && covers(scopes, effective) {
            retained
        } else {
            vec![self.ensure_index(type_name, effective, effective, false).await]
        }
    }

    /// Rebuild one index under its write mutex.
    ///
    /// `Updating` is observable for exactly the duration of the rebuild;
    /// any failure leaves the index `Invalid` for the next fetch to
    /// retry.
    pub async fn update_index(&self, index: &Arc<SearchIndex>) {
        let _guard = index.lock_writes().await;
        if index.status() == IndexStatus::Deleted {
            return;
        }
        index.mark_updating();

        let result: crate::error::Result<u64> = async {
            self.search.clear_index(index.name()).await?;
            let count = self.builder.build(index).await?;
            self.search.refresh_index(index.name()).await?;
            Ok(count)
        }
        .await;

        match result {
            Ok(count) => {
                index.mark_valid();
                tracing::info!(
                    target: "index_mgmt",
                    index = index.name(),
                    documents = count,
                    "index rebuilt"
                );
            }
            Err(e) => {
                index.mark_invalid();
                tracing::warn!(
                    target: "index_mgmt",
                    index = index.name(),
                    error = %e,
                    "index rebuild failed"
                );
            }
        }
    }

    /// Mark the indexes of the selected types invalid without touching
    /// backend contents.
    pub async fn invalidate_indexes(&self, type_name: Option<&str>) -> Vec<Arc<SearchIndex>> {
        let indexes = self.indexes_for(type_name);
        for index in &indexes {
            index.mark_invalid();
            tracing::info!(target: "index_mgmt", index = index.name(), "index invalidated");
        }
        indexes
    }

    /// Remove the indexes of the selected types: backend index first,
    /// metadata second, registry entry last.
    pub async fn remove_indexes(&self, type_name: Option<&str>) -> usize {
        let indexes = self.indexes_for(type_name);
        let mut removed = 0;
        for index in indexes {
            let _guard = index.lock_writes().await;
            if let Err(e) = self.search.delete_index(index.name()).await {
                tracing::warn!(
                    target: "index_mgmt",
                    index = index.name(),
                    error = %e,
                    "could not delete backend index"
                );
            }
            if let Err(e) = metadata::remove_index_metadata(&self.pool, index.name()).await {
                tracing::warn!(
                    target: "index_mgmt",
                    index = index.name(),
                    error = %e,
                    "could not delete index metadata"
                );
            }
            self.registry.remove_by_name(index.name());
            index.mark_deleted();
            removed += 1;
        }
        removed
    }

    fn indexes_for(&self, type_name: Option<&str>) -> Vec<Arc<SearchIndex>> {
        match type_name {
            Some(name) => self.registry.find_for_type(name),
            None => self.registry.all(),
        }
    }
}

/// Backend mapping for an index: the configured `mappings.properties`
/// merged with the forced keyword mappings for `uuid` and `uri`.
fn index_mappings(definition: &IndexDefinition) -> Value {
    let mut properties = definition
        .mappings
        .as_ref()
        .and_then(|m| m.get("properties"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    properties.insert("uuid".to_string(), json!({"type": "keyword"}));
    properties.insert("uri".to_string(), json!({"type": "keyword"}));
    json!({"properties": properties})
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mappings_force_keyword_fields() {
        let config = trellis_config::Configuration::from_value(json!({
            "types": [{
                "type": "document", "on_path": "documents",
                "rdf_type": "http://e/Document",
                "properties": {"title": "http://e/title"},
                "mappings": {"properties": {"title": {"type": "text"}}}
            }]
        }))
        .unwrap();
        let mapped = index_mappings(config.definition("document").unwrap());
        assert_eq!(mapped["properties"]["title"], json!({"type": "text"}));
        assert_eq!(mapped["properties"]["uuid"], json!({"type": "keyword"}));
        assert_eq!(mapped["properties"]["uri"], json!({"type": "keyword"}));
    }
}
