//! Authorization contexts for trellis.
//!
//! Every SPARQL query runs under an *allowed-groups* set: the list of
//! access groups the caller has been granted by the authorization layer.
//! The same set keys the per-authorization search indexes, so this crate
//! provides the canonical representation used both as a cache key and as
//! a SPARQL header:
//!
//! - [`AccessGroup`]: a single group grant with its variables
//! - [`AccessScope`]: a canonicalized set of groups with structural
//!   equality, subset and cover relations
//! - [`index_name`]: the stable index name derived from a type name and
//!   a scope
//!
//! Canonical form sorts the keys inside each group object and then sorts
//! the list by the serialized objects, so two scopes that grant the same
//! groups compare equal regardless of arrival order.

mod error;

pub use error::{AuthError, Result};

use md5::{Digest as Md5Digest, Md5};
use serde::{Deserialize, Serialize};

/// Request header carrying the caller's allowed groups as JSON.
pub const ALLOWED_GROUPS_HEADER: &str = "mu-auth-allowed-groups";

/// Request header marking a privileged query that bypasses row-level
/// filtering.
pub const SUDO_HEADER: &str = "mu-auth-sudo";

/// A single access group grant.
///
/// Serialized as `{"group": <name>, "variables": [..]}`; the field order
/// matches the sorted-key canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessGroup {
    /// Group name, e.g. `"public"` or `"org-member"`.
    pub group: String,
    /// Group variables, e.g. the organization id a membership is
    /// scoped to. Empty for unparameterized groups.
    #[serde(default)]
    pub variables: Vec<String>,
}

impl AccessGroup {
    /// Create a group without variables.
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            variables: Vec::new(),
        }
    }

    /// Create a group with variables.
    pub fn with_variables(
        group: impl Into<String>,
        variables: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            group: group.into(),
            variables: variables.into_iter().map(Into::into).collect(),
        }
    }

    /// Canonical JSON of this group (keys sorted).
    pub fn canonical_json(&self) -> String {
        // Struct fields serialize in declaration order, which is the
        // sorted key order for this shape.
        serde_json::to_string(self).expect("group serialization is infallible")
    }

    /// Whether this group is the `*` wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.group == "*"
    }
}

/// A canonicalized allowed-groups set.
///
/// Construction sorts the groups into canonical order and removes
/// duplicates; equality and hashing are structural over that form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AccessScope {
    groups: Vec<AccessGroup>,
}

impl AccessScope {
    /// Build a scope from groups in any order.
    pub fn new(groups: impl IntoIterator<Item = AccessGroup>) -> Self {
        let mut groups: Vec<AccessGroup> = groups.into_iter().collect();
        groups.sort_by(|a, b| a.canonical_json().cmp(&b.canonical_json()));
        groups.dedup();
        Self { groups }
    }

    /// Parse a scope from a JSON array of group objects, as carried by
    /// the allowed-groups header.
    pub fn from_json(json: &str) -> Result<Self> {
        let groups: Vec<AccessGroup> =
            serde_json::from_str(json).map_err(|e| AuthError::InvalidGroups(e.to_string()))?;
        Ok(Self::new(groups))
    }

    /// The groups in canonical order.
    pub fn groups(&self) -> &[AccessGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Canonical JSON array of the scope. Used as registry cache key and
    /// as the allowed-groups header value.
    pub fn cache_key(&self) -> String {
        let parts: Vec<String> = self.groups.iter().map(AccessGroup::canonical_json).collect();
        format!("[{}]", parts.join(","))
    }

    /// Structural membership test.
    pub fn contains(&self, group: &AccessGroup) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    /// `self ⊆ other`: every group of `self` is structurally in `other`.
    pub fn is_subset_of(&self, other: &AccessScope) -> bool {
        self.groups.iter().all(|g| other.contains(g))
    }

    /// Strict subset: subset and not equal.
    pub fn is_strict_subset_of(&self, other: &AccessScope) -> bool {
        self != other && self.is_subset_of(other)
    }

    /// Copy of this scope with the ignored groups removed.
    ///
    /// Applied before canonicalization-sensitive operations so that
    /// groups configured as irrelevant for indexing never fragment the
    /// index space.
    pub fn without(&self, ignored: &[AccessGroup]) -> AccessScope {
        AccessScope::new(
            self.groups
                .iter()
                .filter(|g| !ignored.contains(g))
                .cloned(),
        )
    }

    /// Whether this scope contains a wildcard grant.
    pub fn has_wildcard(&self) -> bool {
        self.groups.iter().any(AccessGroup::is_wildcard)
    }
}

impl FromIterator<AccessGroup> for AccessScope {
    fn from_iter<T: IntoIterator<Item = AccessGroup>>(iter: T) -> Self {
        AccessScope::new(iter)
    }
}

/// Cover test: does the union of `scopes` contain every group of
/// `target`?
///
/// Used to decide whether a set of partial indexes can answer a query
/// for `target` without synthesising a new index.
pub fn covers<'a, I>(scopes: I, target: &AccessScope) -> bool
where
    I: IntoIterator<Item = &'a AccessScope> + Clone,
{
    target
        .groups()
        .iter()
        .all(|g| scopes.clone().into_iter().any(|s| s.contains(g)))
}

/// Stable index name for a (type, allowed-groups) identity.
///
/// `MD5(type_name + "-" + join("-", canonical group jsons))`, rendered
/// as lowercase hex. Recomputing for the same identity always yields
/// the same name, so the name doubles as the backend index id.
pub fn index_name(type_name: &str, allowed_groups: &AccessScope) -> String {
    let parts: Vec<String> = allowed_groups
        .groups()
        .iter()
        .map(AccessGroup::canonical_json)
        .collect();
    let input = format!("{}-{}", type_name, parts.join("-"));
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
