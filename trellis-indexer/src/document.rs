//! Document projection.
//!
//! The document builder turns (resource URI, index definition) into the
//! JSON document stored in the search backend. All configured property
//! paths of a property set are gathered in a single CONSTRUCT query:
//! each property becomes one UNION alternative binding its values to a
//! synthetic subject `ext:<property_name>` through `ext:value`, so the
//! number of round-trips does not grow with the property count.
//!
//! Composite indexes build one sub-document per sub-index whose
//! rdf:types match the resource, then merge them; incompatible values
//! surface as a per-document failure and never break the surrounding
//! batch.

use crate::error::{IndexerError, Result};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use trellis_client::{
    AttachmentCache, SparqlClient, SparqlTerm, TermKind, TextExtractor,
};
use trellis_config::{
    path_to_sparql, IndexDefinition, IndexKind, PropertyDefinition, PropertyKind, Settings,
};
use trellis_vocab::{ext, xsd, SHARE_SCHEME};

/// Builds projected documents for resources.
pub struct DocumentBuilder {
    attachment_path_base: PathBuf,
    maximum_file_size: u64,
    extractor: Arc<dyn TextExtractor>,
    cache: AttachmentCache,
}

impl std::fmt::Debug for DocumentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentBuilder")
            .field("attachment_path_base", &self.attachment_path_base)
            .finish_non_exhaustive()
    }
}

impl DocumentBuilder {
    pub fn new(settings: &Settings, extractor: Arc<dyn TextExtractor>, cache: AttachmentCache) -> Self {
        Self {
            attachment_path_base: settings.attachment_path_base.clone(),
            maximum_file_size: settings.maximum_file_size,
            extractor,
            cache,
        }
    }

    /// Build the document for a resource under the authorization of the
    /// given client.
    pub async fn build(
        &self,
        client: &dyn SparqlClient,
        uri: &str,
        definition: &IndexDefinition,
    ) -> Result<Value> {
        let mut document = match &definition.kind {
            IndexKind::Regular(regular) => self.project(client, uri, &regular.properties).await?,
            IndexKind::Composite(composite) => {
                let types = resource_types(client, uri).await?;
                let mut merged = Map::new();
                for sub in &composite.sub_indexes {
                    if !sub.rdf_types.iter().any(|t| types.contains(t)) {
                        continue;
                    }
                    let sub_document = self.project(client, uri, &sub.properties).await?;
                    merged = merge_documents(merged, sub_document)?;
                }
                merged
            }
        };
        document.insert("uri".to_string(), Value::String(uri.to_string()));
        Ok(Value::Object(document))
    }

    /// Project one property set. Boxed because nested properties
    /// recurse into related resources.
    fn project<'a>(
        &'a self,
        client: &'a dyn SparqlClient,
        uri: &'a str,
        properties: &'a [PropertyDefinition],
    ) -> BoxFuture<'a, Result<Map<String, Value>>> {
        Box::pin(async move {
            let query = projection_query(uri, properties);
            let triples = client.construct(&query).await?;

            // Group values by their synthetic property subject.
            let mut grouped: HashMap<String, Vec<SparqlTerm>> = HashMap::new();
            for triple in triples {
                if triple.predicate.value == ext::VALUE {
                    grouped
                        .entry(triple.subject.value)
                        .or_default()
                        .push(triple.object);
                }
            }

            let mut document = Map::new();
            for property in properties {
                let values = grouped
                    .remove(&property_subject(property))
                    .unwrap_or_default();
                let value = self.materialize(client, property, values).await?;
                document.insert(property.name.clone(), value);
            }
            Ok(document)
        })
    }

    async fn materialize(
        &self,
        client: &dyn SparqlClient,
        property: &PropertyDefinition,
        values: Vec<SparqlTerm>,
    ) -> Result<Value> {
        match &property.kind {
            PropertyKind::Simple | PropertyKind::Lambert72 => {
                Ok(denumerate(values.iter().map(simple_value).collect()))
            }
            PropertyKind::LanguageString => Ok(language_object(&values)),
            PropertyKind::Attachment { .. } => Ok(self.attachment_values(&values).await),
            PropertyKind::Nested { sub_properties, .. } => {
                let mut documents = Vec::new();
                for term in &values {
                    if term.kind != TermKind::Uri {
                        continue;
                    }
                    let mut sub = self.project(client, &term.value, sub_properties).await?;
                    sub.insert("uri".to_string(), Value::String(term.value.clone()));
                    documents.push(Value::Object(sub));
                }
                Ok(Value::Array(documents))
            }
        }
    }

    async fn attachment_values(&self, values: &[SparqlTerm]) -> Value {
        let mut out = Vec::new();
        for term in values {
            let Some(relative) = term.value.strip_prefix(SHARE_SCHEME) else {
                tracing::warn!(
                    target: "indexing",
                    value = %term.value,
                    "attachment value is not a share:// reference"
                );
                continue;
            };
            let path = self.attachment_path_base.join(relative.trim_start_matches('/'));
            let content = self.attachment_content(&path).await;
            out.push(json!({ "content": content }));
        }
        Value::Array(out)
    }

    /// Extract the text of one attachment file, if possible.
    ///
    /// A missing, empty or oversized file yields `None`; extraction is
    /// only attempted for files that pass those checks, and results are
    /// cached by content hash.
    pub(crate) async fn attachment_content(&self, path: &Path) -> Option<String> {
        let blob = match tokio::fs::read(path).await {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(target: "tika", path = %path.display(), error = %e, "attachment unreadable");
                return None;
            }
        };
        if blob.is_empty() {
            return None;
        }
        if blob.len() as u64 > self.maximum_file_size {
            tracing::warn!(
                target: "tika",
                path = %path.display(),
                size = blob.len(),
                "attachment exceeds maximum file size"
            );
            return None;
        }

        let key = AttachmentCache::key_for(&blob);
        if let Some(text) = self.cache.get(&key).await {
            return Some(text);
        }
        match self.extractor.extract_text(path, &blob).await {
            Ok(Some(text)) => {
                self.cache.put(&key, &text).await;
                Some(text)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(target: "tika", path = %path.display(), error = %e, "text extraction failed");
                None
            }
        }
    }
}

/// Synthetic subject IRI for a property.
fn property_subject(property: &PropertyDefinition) -> String {
    format!("{}{}", ext::NAMESPACE, property.name)
}

/// The single projection CONSTRUCT for a property set.
fn projection_query(uri: &str, properties: &[PropertyDefinition]) -> String {
    let mut template = String::new();
    let mut alternatives = Vec::with_capacity(properties.len());
    for (i, property) in properties.iter().enumerate() {
        template.push_str(&format!(
            "  <{}> <{}> ?var{} .\n",
            property_subject(property),
            ext::VALUE,
            i
        ));
        alternatives.push(format!(
            "  {{ <{}> {} ?var{} . }}",
            uri,
            path_to_sparql(&property.path),
            i
        ));
    }
    format!(
        "CONSTRUCT {{\n{template}}} WHERE {{\n{}\n}}",
        alternatives.join("\n  UNION\n")
    )
}

/// The actual rdf:types of a resource, as visible to the client's
/// authorization.
async fn resource_types(client: &dyn SparqlClient, uri: &str) -> Result<Vec<String>> {
    let response = client
        .select(&format!("SELECT DISTINCT ?type WHERE {{ <{uri}> a ?type }}"))
        .await?;
    Ok(response.column("type").map(|t| t.value.clone()).collect())
}

/// Map one RDF term to a JSON value by datatype.
fn simple_value(term: &SparqlTerm) -> Value {
    match term.kind {
        TermKind::Uri | TermKind::Bnode | TermKind::Triple => Value::String(term.value.clone()),
        TermKind::Literal | TermKind::TypedLiteral => match term.datatype.as_deref() {
            Some(xsd::INTEGER) | Some(xsd::INT) | Some(xsd::LONG) => term
                .value
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(term.value.clone())),
            Some(xsd::DECIMAL) | Some(xsd::DOUBLE) | Some(xsd::FLOAT) => term
                .value
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(term.value.clone())),
            Some(xsd::BOOLEAN) => Value::Bool(term.value == "true" || term.value == "1"),
            // Dates and times are indexed as their ISO lexical form.
            Some(xsd::DATE) | Some(xsd::DATE_TIME) | Some(xsd::TIME) => {
                Value::String(term.value.clone())
            }
            _ => Value::String(term.value.clone()),
        },
    }
}

/// Bucket language-tagged values into one object; untagged values land
/// under `"default"`.
fn language_object(values: &[SparqlTerm]) -> Value {
    let mut buckets: Map<String, Value> = Map::new();
    for term in values {
        let key = term.lang.clone().unwrap_or_else(|| "default".to_string());
        match buckets.entry(key).or_insert_with(|| Value::Array(Vec::new())) {
            Value::Array(bucket) => bucket.push(Value::String(term.value.clone())),
            _ => unreachable!("language buckets are arrays"),
        }
    }
    Value::Object(buckets)
}

/// Collapse a value list: zero values become null, a single value the
/// scalar itself, several values an array.
fn denumerate(mut values: Vec<Value>) -> Value {
    match values.len() {
        0 => Value::Null,
        1 => values.pop().expect("length checked"),
        _ => Value::Array(values),
    }
}

/// Merge two sub-documents field by field.
fn merge_documents(a: Map<String, Value>, b: Map<String, Value>) -> Result<Map<String, Value>> {
    let mut out = a;
    for (field, value_b) in b {
        let merged = match out.remove(&field) {
            Some(value_a) => smart_merge(&field, value_a, value_b)?,
            None => value_b,
        };
        out.insert(field, merged);
    }
    Ok(out)
}

/// Merge two field values.
///
/// Null absorbs non-null; arrays concatenate and deduplicate; maps
/// merge recursively; equal values collapse; distinct scalars pair
/// into an array. A map meeting a non-map is incompatible and fails
/// the document.
pub fn smart_merge(field: &str, a: Value, b: Value) -> Result<Value> {
    Ok(match (a, b) {
        (Value::Null, other) | (other, Value::Null) => other,
        (Value::Object(map_a), Value::Object(map_b)) => {
            Value::Object(merge_documents(map_a, map_b)?)
        }
        (Value::Object(_), _) | (_, Value::Object(_)) => {
            return Err(IndexerError::MergeConflict {
                field: field.to_string(),
            })
        }
        (Value::Array(mut items), Value::Array(other)) => {
            for value in other {
                if !items.contains(&value) {
                    items.push(value);
                }
            }
            Value::Array(items)
        }
        (Value::Array(mut items), scalar) | (scalar, Value::Array(mut items)) => {
            if !items.contains(&scalar) {
                items.push(scalar);
            }
            Value::Array(items)
        }
        (a, b) if a == b => a,
        (a, b) => Value::Array(vec![a, b]),
    })
}

/// The backend document id: the resource's uuid value.
pub fn document_id(document: &Value) -> Option<&str> {
    match document.get("uuid")? {
        Value::String(id) => Some(id),
        // Multiple uuids should not happen; take a stable one.
        Value::Array(ids) => ids.first().and_then(Value::as_str),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_config::PathElement;

    fn term_int(v: &str) -> SparqlTerm {
        SparqlTerm::typed_literal(v, xsd::INTEGER)
    }

    #[test]
    fn simple_values_map_by_datatype() {
        assert_eq!(simple_value(&term_int("5")), json!(5));
        assert_eq!(
            simple_value(&SparqlTerm::typed_literal("2.5", xsd::DOUBLE)),
            json!(2.5)
        );
        assert_eq!(
            simple_value(&SparqlTerm::typed_literal("true", xsd::BOOLEAN)),
            json!(true)
        );
        assert_eq!(
            simple_value(&SparqlTerm::typed_literal("2024-01-02", xsd::DATE)),
            json!("2024-01-02")
        );
        assert_eq!(simple_value(&SparqlTerm::literal("plain")), json!("plain"));
        assert_eq!(
            simple_value(&SparqlTerm::uri("http://example.org/a")),
            json!("http://example.org/a")
        );
        // Unparseable numerics fall back to the lexical form.
        assert_eq!(simple_value(&term_int("not-a-number")), json!("not-a-number"));
    }

    #[test]
    fn denumeration_collapses_by_length() {
        assert_eq!(denumerate(vec![]), Value::Null);
        assert_eq!(denumerate(vec![json!("a")]), json!("a"));
        assert_eq!(denumerate(vec![json!("a"), json!("b")]), json!(["a", "b"]));
    }

    #[test]
    fn language_strings_bucket_by_tag() {
        let values = vec![
            SparqlTerm::lang_literal("hallo", "nl"),
            SparqlTerm::lang_literal("hello", "en"),
            SparqlTerm::lang_literal("hoi", "nl"),
            SparqlTerm::literal("plain"),
        ];
        assert_eq!(
            language_object(&values),
            json!({"nl": ["hallo", "hoi"], "en": ["hello"], "default": ["plain"]})
        );
        // Always an object, even without values.
        assert_eq!(language_object(&[]), json!({}));
    }

    #[test]
    fn projection_query_unions_all_properties() {
        let properties = vec![
            PropertyDefinition::simple("title", "http://purl.org/dc/terms/title"),
            PropertyDefinition {
                name: "memberships".to_string(),
                path: vec![PathElement::parse("^http://example.org/member")],
                kind: PropertyKind::Simple,
            },
        ];
        let query = projection_query("http://example.org/a", &properties);
        assert!(query.starts_with("CONSTRUCT {"));
        assert!(query.contains(&format!("<{}title> <{}> ?var0", ext::NAMESPACE, ext::VALUE)));
        assert!(query.contains("<http://example.org/a> <http://purl.org/dc/terms/title> ?var0"));
        assert!(query.contains("UNION"));
        assert!(query.contains("^<http://example.org/member> ?var1"));
    }

    #[test]
    fn smart_merge_absorbs_null() {
        assert_eq!(smart_merge("f", Value::Null, json!("x")).unwrap(), json!("x"));
        assert_eq!(smart_merge("f", json!("x"), Value::Null).unwrap(), json!("x"));
        assert_eq!(smart_merge("f", Value::Null, Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn smart_merge_concatenates_and_dedups_arrays() {
        assert_eq!(
            smart_merge("f", json!(["a", "b"]), json!(["b", "c"])).unwrap(),
            json!(["a", "b", "c"])
        );
        assert_eq!(
            smart_merge("f", json!(["a"]), json!("b")).unwrap(),
            json!(["a", "b"])
        );
    }

    #[test]
    fn smart_merge_pairs_distinct_scalars() {
        assert_eq!(
            smart_merge("f", json!("Jane"), json!("J.")).unwrap(),
            json!(["Jane", "J."])
        );
        assert_eq!(smart_merge("f", json!("Jane"), json!("Jane")).unwrap(), json!("Jane"));
    }

    #[test]
    fn smart_merge_is_commutative_up_to_order() {
        let ab = smart_merge("f", json!("a"), json!("b")).unwrap();
        let ba = smart_merge("f", json!("b"), json!("a")).unwrap();
        let (Value::Array(ab), Value::Array(ba)) = (ab, ba) else {
            panic!("expected arrays");
        };
        assert_eq!(ab.len(), 2);
        assert!(ba.iter().all(|v| ab.contains(v)));
    }

    #[test]
    fn smart_merge_is_idempotent_on_maps() {
        let a = json!({"name": "Jane", "tags": ["x", "y"], "age": 41});
        assert_eq!(smart_merge("f", a.clone(), a.clone()).unwrap(), a);
    }

    #[test]
    fn smart_merge_merges_maps_recursively() {
        let merged = smart_merge(
            "f",
            json!({"inner": {"a": "x"}}),
            json!({"inner": {"b": "y"}, "other": 1}),
        )
        .unwrap();
        assert_eq!(merged, json!({"inner": {"a": "x", "b": "y"}, "other": 1}));
    }

    #[test]
    fn smart_merge_rejects_map_against_scalar() {
        let err = smart_merge("given_name", json!({"nl": []}), json!("Jane")).unwrap_err();
        assert!(matches!(err, IndexerError::MergeConflict { field } if field == "given_name"));
    }

    #[test]
    fn document_id_prefers_string_uuid() {
        assert_eq!(document_id(&json!({"uuid": "abc"})), Some("abc"));
        assert_eq!(document_id(&json!({"uuid": ["abc", "def"]})), Some("abc"));
        assert_eq!(document_id(&json!({"title": "x"})), None);
        assert_eq!(document_id(&json!({"uuid": null})), None);
    }
}
