//! Live search index instances.
//!
//! A [`SearchIndex`] is one named projection instance for one
//! (type, allowed-groups) identity. Its name is a pure function of that
//! identity, its status is an explicit state machine, and document
//! writes against it are serialized by a per-index mutex.

use std::sync::RwLock;
use tokio::sync::{Mutex, MutexGuard};
use trellis_auth::{index_name, AccessScope};
use trellis_vocab::search;

/// Lifecycle state of a search index.
///
/// Transitions: `Invalid → Updating → {Valid, Invalid}`; `Valid →
/// Invalid` on invalidation; any state `→ Deleted` on removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    /// Backend contents are consistent with the triplestore.
    Valid,
    /// Backend contents are stale or missing; a rebuild is needed.
    Invalid,
    /// A rebuild is in progress.
    Updating,
    /// The index has been removed and must no longer be written.
    Deleted,
}

/// One live index for a (type, allowed-groups) identity.
#[derive(Debug)]
pub struct SearchIndex {
    uri: String,
    name: String,
    type_name: String,
    allowed_groups: AccessScope,
    used_groups: AccessScope,
    is_eager: bool,
    status: RwLock<IndexStatus>,
    write_lock: Mutex<()>,
}

impl SearchIndex {
    /// Create an index for an identity. The name and metadata IRI are
    /// derived deterministically from the type name and allowed
    /// groups.
    pub fn new(
        type_name: impl Into<String>,
        allowed_groups: AccessScope,
        used_groups: AccessScope,
        is_eager: bool,
        status: IndexStatus,
    ) -> Self {
        let type_name = type_name.into();
        let name = index_name(&type_name, &allowed_groups);
        let uri = format!("{}{}", search::INDEX_BASE, name);
        Self {
            uri,
            name,
            type_name,
            allowed_groups,
            used_groups,
            is_eager,
            status: RwLock::new(status),
            write_lock: Mutex::new(()),
        }
    }

    /// Metadata IRI of this index.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Backend index name (MD5 of the identity tuple).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured index type this instance belongs to.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn allowed_groups(&self) -> &AccessScope {
        &self.allowed_groups
    }

    pub fn used_groups(&self) -> &AccessScope {
        &self.used_groups
    }

    /// Whether this index was created for a configured eager group
    /// tuple.
    pub fn is_eager(&self) -> bool {
        self.is_eager
    }

    pub fn status(&self) -> IndexStatus {
        *self.status.read().expect("index status lock poisoned")
    }

    fn set_status(&self, status: IndexStatus) {
        *self.status.write().expect("index status lock poisoned") = status;
    }

    pub fn mark_valid(&self) {
        self.set_status(IndexStatus::Valid);
    }

    pub fn mark_invalid(&self) {
        // A deleted index stays deleted.
        if self.status() != IndexStatus::Deleted {
            self.set_status(IndexStatus::Invalid);
        }
    }

    pub fn mark_updating(&self) {
        self.set_status(IndexStatus::Updating);
    }

    pub fn mark_deleted(&self) {
        self.set_status(IndexStatus::Deleted);
    }

    /// Acquire the per-index write mutex. Held across bulk rebuilds and
    /// single-document writes so the two can never interleave.
    pub async fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_auth::AccessGroup;

    #[test]
    fn name_is_a_pure_function_of_identity() {
        let scope = AccessScope::new(vec![AccessGroup::new("reader")]);
        let a = SearchIndex::new("document", scope.clone(), scope.clone(), false, IndexStatus::Invalid);
        let b = SearchIndex::new("document", scope.clone(), scope, false, IndexStatus::Valid);
        assert_eq!(a.name(), b.name());
        assert_eq!(a.uri(), b.uri());
        assert!(a.uri().ends_with(a.name()));
    }

    #[test]
    fn status_transitions() {
        let scope = AccessScope::default();
        let index = SearchIndex::new("document", scope.clone(), scope, false, IndexStatus::Invalid);
        assert_eq!(index.status(), IndexStatus::Invalid);
        index.mark_updating();
        assert_eq!(index.status(), IndexStatus::Updating);
        index.mark_valid();
        assert_eq!(index.status(), IndexStatus::Valid);
        index.mark_deleted();
        index.mark_invalid();
        assert_eq!(index.status(), IndexStatus::Deleted);
    }
}
