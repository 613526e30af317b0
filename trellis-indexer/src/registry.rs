//! In-memory search index registry.
//!
//! A two-level map `type_name → canonical allowed-groups key →
//! SearchIndex`, guarded by the master mutex. Exactly one entry exists
//! per identity at any time: insertion goes through
//! [`SearchIndexRegistry::get_or_insert_with`], which checks and
//! inserts under one lock acquisition.
//!
//! The master mutex guards only map access; no I/O happens while it is
//! held.

use crate::index::SearchIndex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type IndexMap = HashMap<String, HashMap<String, Arc<SearchIndex>>>;

/// Registry of live indexes keyed by (type, canonical allowed groups).
#[derive(Debug, Default)]
pub struct SearchIndexRegistry {
    inner: Mutex<IndexMap>,
}

impl SearchIndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexMap> {
        self.inner.lock().expect("index registry lock poisoned")
    }

    /// Look up the index for an identity.
    pub fn get(&self, type_name: &str, groups_key: &str) -> Option<Arc<SearchIndex>> {
        self.lock().get(type_name)?.get(groups_key).cloned()
    }

    /// Return the existing index for an identity or insert the one
    /// produced by `create`. The boolean is true when a new entry was
    /// inserted.
    pub fn get_or_insert_with(
        &self,
        type_name: &str,
        groups_key: &str,
        create: impl FnOnce() -> SearchIndex,
    ) -> (Arc<SearchIndex>, bool) {
        let mut map = self.lock();
        let per_type = map.entry(type_name.to_string()).or_default();
        if let Some(existing) = per_type.get(groups_key) {
            (Arc::clone(existing), false)
        } else {
            let index = Arc::new(create());
            per_type.insert(groups_key.to_string(), Arc::clone(&index));
            (index, true)
        }
    }

    /// Insert an index built elsewhere (metadata restore at startup).
    /// An existing entry for the identity is kept untouched.
    pub fn insert(&self, index: Arc<SearchIndex>) {
        let mut map = self.lock();
        map.entry(index.type_name().to_string())
            .or_default()
            .entry(index.allowed_groups().cache_key())
            .or_insert(index);
    }

    /// Find an index by its backend name.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<SearchIndex>> {
        self.lock()
            .values()
            .flat_map(HashMap::values)
            .find(|index| index.name() == name)
            .cloned()
    }

    /// All indexes of one type.
    pub fn find_for_type(&self, type_name: &str) -> Vec<Arc<SearchIndex>> {
        self.lock()
            .get(type_name)
            .map(|per_type| per_type.values().cloned().collect())
            .unwrap_or_default()
    }

    /// All registered indexes.
    pub fn all(&self) -> Vec<Arc<SearchIndex>> {
        self.lock()
            .values()
            .flat_map(HashMap::values)
            .cloned()
            .collect()
    }

    /// Remove an index by backend name, returning it if present.
    pub fn remove_by_name(&self, name: &str) -> Option<Arc<SearchIndex>> {
        let mut map = self.lock();
        for per_type in map.values_mut() {
            let key = per_type
                .iter()
                .find(|(_, index)| index.name() == name)
                .map(|(key, _)| key.clone());
            if let Some(key) = key {
                return per_type.remove(&key);
            }
        }
        None
    }
}
