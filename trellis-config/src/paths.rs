//! Property-path dependency cache.
//!
//! The delta processor has to answer, for every incoming triple, which
//! index types are affected and through which configured paths. This
//! module precomputes a bidirectional index at configuration load time:
//!
//! - predicate IRI → every (index type, full path, position) where the
//!   predicate occurs, in forward or inverse form
//! - rdf:type IRI → index types fed by resources of that type
//!
//! Nested properties are flattened: a nested projection contributes its
//! link path plus one expanded path per reachable leaf, so a change deep
//! in a related resource still maps back to the root subjects.

use crate::definition::{IndexDefinition, PathElement, PropertyDefinition, PropertyKind};
use std::collections::HashMap;
use std::sync::Arc;

/// One occurrence of a predicate inside a configured path.
#[derive(Debug, Clone)]
pub struct PathOccurrence {
    /// Index type name the path belongs to.
    pub type_name: String,
    /// The full expanded path.
    pub path: Arc<[PathElement]>,
    /// Position of the predicate inside `path`.
    pub position: usize,
}

impl PathOccurrence {
    /// The path element at this occurrence.
    pub fn element(&self) -> &PathElement {
        &self.path[self.position]
    }

    /// Path steps before the occurrence.
    pub fn prefix(&self) -> &[PathElement] {
        &self.path[..self.position]
    }

    /// Path steps after the occurrence.
    pub fn suffix(&self) -> &[PathElement] {
        &self.path[self.position + 1..]
    }

    /// Whether the occurrence is the last step of its path.
    pub fn is_terminal(&self) -> bool {
        self.position + 1 == self.path.len()
    }
}

/// Precomputed predicate and rdf:type lookup tables.
#[derive(Debug, Default)]
pub struct PathCache {
    by_predicate: HashMap<String, Vec<PathOccurrence>>,
    by_rdf_type: HashMap<String, Vec<String>>,
}

impl PathCache {
    /// Build the cache for a set of index definitions.
    pub fn build(definitions: &[IndexDefinition]) -> Self {
        let mut cache = PathCache::default();

        for def in definitions {
            for rdf_type in def.related_rdf_types() {
                let entry = cache.by_rdf_type.entry(rdf_type.to_string()).or_default();
                if !entry.contains(&def.name) {
                    entry.push(def.name.clone());
                }
            }

            let mut paths: Vec<Vec<PathElement>> = Vec::new();
            for set in def.property_sets() {
                for prop in set {
                    expand_paths(prop, &[], &mut paths);
                }
            }
            paths.sort();
            paths.dedup();

            for path in paths {
                let path: Arc<[PathElement]> = path.into();
                for (position, element) in path.iter().enumerate() {
                    cache
                        .by_predicate
                        .entry(element.iri.clone())
                        .or_default()
                        .push(PathOccurrence {
                            type_name: def.name.clone(),
                            path: Arc::clone(&path),
                            position,
                        });
                }
            }
        }

        cache
    }

    /// Whether any configured path mentions this predicate, forward or
    /// inverse.
    pub fn contains_predicate(&self, predicate: &str) -> bool {
        self.by_predicate.contains_key(predicate)
    }

    /// All occurrences of a predicate across configured paths.
    pub fn occurrences(&self, predicate: &str) -> &[PathOccurrence] {
        self.by_predicate
            .get(predicate)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Index types with at least one path containing the predicate.
    pub fn types_for_predicate(&self, predicate: &str) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .occurrences(predicate)
            .iter()
            .map(|o| o.type_name.as_str())
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    /// Index types fed by resources of the given rdf:type.
    pub fn types_for_rdf_type(&self, rdf_type: &str) -> &[String] {
        self.by_rdf_type
            .get(rdf_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Expand a property into its full dependency paths, prefixed by the
/// path that reaches it.
fn expand_paths(prop: &PropertyDefinition, prefix: &[PathElement], out: &mut Vec<Vec<PathElement>>) {
    let mut own: Vec<PathElement> = prefix.to_vec();
    own.extend(prop.path.iter().cloned());
    out.push(own.clone());

    if let PropertyKind::Nested { sub_properties, .. } = &prop.kind {
        for sub in sub_properties {
            expand_paths(sub, &own, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::lower_definitions;
    use serde_json::json;

    fn build_cache(types: Vec<serde_json::Value>) -> PathCache {
        let mut errors = Vec::new();
        let defs = lower_definitions(&types, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        PathCache::build(&defs)
    }

    #[test]
    fn maps_predicates_to_types() {
        let cache = build_cache(vec![json!({
            "type": "document", "on_path": "documents",
            "rdf_type": "http://e/Document",
            "properties": {"title": "http://purl.org/dc/terms/title"}
        })]);
        assert!(cache.contains_predicate("http://purl.org/dc/terms/title"));
        assert_eq!(
            cache.types_for_predicate("http://purl.org/dc/terms/title"),
            vec!["document"]
        );
        assert!(!cache.contains_predicate("http://e/unrelated"));
    }

    #[test]
    fn maps_rdf_types_to_types() {
        let cache = build_cache(vec![json!({
            "type": "document", "on_path": "documents",
            "rdf_type": ["http://e/Document", "http://e/Report"],
            "properties": {}
        })]);
        assert_eq!(cache.types_for_rdf_type("http://e/Report"), ["document"]);
        assert!(cache.types_for_rdf_type("http://e/Other").is_empty());
    }

    #[test]
    fn expands_nested_paths() {
        let cache = build_cache(vec![json!({
            "type": "case", "on_path": "cases",
            "rdf_type": "http://e/Case",
            "properties": {
                "owner": {
                    "via": "http://e/owner",
                    "properties": {"name": "http://e/name"}
                }
            }
        })]);

        // The leaf predicate occurs at position 1 of the expanded path.
        let occurrences = cache.occurrences("http://e/name");
        assert_eq!(occurrences.len(), 1);
        let occ = &occurrences[0];
        assert_eq!(occ.position, 1);
        assert_eq!(occ.prefix().len(), 1);
        assert_eq!(occ.prefix()[0].iri, "http://e/owner");
        assert!(occ.is_terminal());

        // The link predicate occurs in both the link path and the
        // expanded leaf path.
        let occurrences = cache.occurrences("http://e/owner");
        assert_eq!(occurrences.len(), 2);
        assert!(occurrences.iter().all(|o| o.position == 0));
    }

    #[test]
    fn records_inverse_occurrences() {
        let cache = build_cache(vec![json!({
            "type": "person", "on_path": "people",
            "rdf_type": "http://e/Person",
            "properties": {"memberships": "^http://e/member"}
        })]);
        let occurrences = cache.occurrences("http://e/member");
        assert_eq!(occurrences.len(), 1);
        assert!(occurrences[0].element().inverse);
    }
}
