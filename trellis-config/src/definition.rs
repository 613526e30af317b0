//! Typed index and property definitions.
//!
//! The configuration document declares indexes as JSON; this module
//! lowers the raw JSON into a closed, typed model:
//!
//! - [`IndexDefinition`] with a tagged [`IndexKind`] (regular vs
//!   composite; never both)
//! - [`PropertyDefinition`] with a closed [`PropertyKind`]
//! - [`PathElement`] for property paths with optional `^` inverse
//!   markers
//!
//! Lowering collects every problem it finds instead of failing on the
//! first, so startup can abort with one aggregated report.

use serde_json::Value;
use trellis_vocab::mu;

/// One step of a property path. `^` in the configured IRI marks an
/// inverse traversal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathElement {
    /// Bare predicate IRI, without the inverse marker.
    pub iri: String,
    /// Whether this step is traversed object-to-subject.
    pub inverse: bool,
}

impl PathElement {
    /// Parse a configured path step, stripping a leading `^`.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('^') {
            Some(iri) => Self {
                iri: iri.to_string(),
                inverse: true,
            },
            None => Self {
                iri: raw.to_string(),
                inverse: false,
            },
        }
    }

    /// Render as a SPARQL path step: `<iri>` or `^<iri>`.
    pub fn to_sparql(&self) -> String {
        if self.inverse {
            format!("^<{}>", self.iri)
        } else {
            format!("<{}>", self.iri)
        }
    }
}

/// Render a full property path as a SPARQL path expression.
pub fn path_to_sparql(path: &[PathElement]) -> String {
    path.iter()
        .map(PathElement::to_sparql)
        .collect::<Vec<_>>()
        .join("/")
}

/// How a property's RDF values are materialized into the document.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    /// Literal values mapped by datatype; IRIs mapped to strings.
    Simple,
    /// One object keyed by language tag, untagged values under
    /// `"default"`.
    LanguageString,
    /// Lambert 72 planar coordinates, carried through as simple values.
    Lambert72,
    /// `share://` file references resolved to extracted text.
    Attachment {
        /// Optional ingest pipeline used when uploading raw attachments.
        pipeline: Option<String>,
    },
    /// A related resource projected recursively.
    Nested {
        /// Expected rdf:type of the related resource, if declared.
        rdf_type: Option<String>,
        /// Projection of the related resource.
        sub_properties: Vec<PropertyDefinition>,
    },
}

/// A named property projection.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDefinition {
    /// Document field name.
    pub name: String,
    /// Property path from the root resource to the values.
    pub path: Vec<PathElement>,
    /// Materialization behavior.
    pub kind: PropertyKind,
}

impl PropertyDefinition {
    /// Shorthand for a single-step simple property.
    pub fn simple(name: impl Into<String>, iri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: vec![PathElement {
                iri: iri.into(),
                inverse: false,
            }],
            kind: PropertyKind::Simple,
        }
    }
}

/// A regular index: documents project resources of the declared
/// rdf:types.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularIndex {
    pub rdf_types: Vec<String>,
    pub properties: Vec<PropertyDefinition>,
}

/// One expanded sub-index of a composite index.
///
/// Produced at load time by resolving each composite property through
/// its per-type mapping (falling back to the composite property name),
/// so the sub-index carries ready-to-use property definitions under the
/// composite's field names.
#[derive(Debug, Clone, PartialEq)]
pub struct SubIndex {
    /// Name of the regular index definition this sub-index was derived
    /// from.
    pub source_type: String,
    pub rdf_types: Vec<String>,
    pub properties: Vec<PropertyDefinition>,
}

/// A composite index: documents may merge projections from several
/// sub-indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeIndex {
    pub sub_indexes: Vec<SubIndex>,
}

/// Whether an index is regular or composite. A definition is exactly
/// one of the two.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKind {
    Regular(RegularIndex),
    Composite(CompositeIndex),
}

/// A named index projection.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    /// Index type name (the `type` key in configuration).
    pub name: String,
    /// Request path this index serves.
    pub on_path: String,
    pub kind: IndexKind,
    /// Optional backend mapping properties.
    pub mappings: Option<Value>,
    /// Optional backend settings.
    pub settings: Option<Value>,
}

impl IndexDefinition {
    /// The rdf:types whose resources feed this index: the regular
    /// index's own types, or the union over sub-indexes for a
    /// composite.
    pub fn related_rdf_types(&self) -> Vec<&str> {
        match &self.kind {
            IndexKind::Regular(r) => r.rdf_types.iter().map(String::as_str).collect(),
            IndexKind::Composite(c) => {
                let mut types: Vec<&str> = c
                    .sub_indexes
                    .iter()
                    .flat_map(|s| s.rdf_types.iter().map(String::as_str))
                    .collect();
                types.sort_unstable();
                types.dedup();
                types
            }
        }
    }

    /// Every property set this index projects (one for a regular
    /// index, one per sub-index for a composite).
    pub fn property_sets(&self) -> Vec<&[PropertyDefinition]> {
        match &self.kind {
            IndexKind::Regular(r) => vec![&r.properties],
            IndexKind::Composite(c) => {
                c.sub_indexes.iter().map(|s| s.properties.as_slice()).collect()
            }
        }
    }
}

/// The synthetic `uuid` property injected into every property set.
fn uuid_property() -> PropertyDefinition {
    PropertyDefinition::simple("uuid", mu::UUID)
}

fn inject_uuid(properties: &mut Vec<PropertyDefinition>) {
    if !properties.iter().any(|p| p.name == "uuid") {
        properties.push(uuid_property());
    }
}

// ---------------------------------------------------------------------
// Lowering from raw JSON
// ---------------------------------------------------------------------

/// Lower the raw `types` array into typed definitions, appending every
/// validation problem to `errors`. Returns the definitions that could
/// be lowered; callers must treat a non-empty `errors` as fatal.
pub(crate) fn lower_definitions(raw_types: &[Value], errors: &mut Vec<String>) -> Vec<IndexDefinition> {
    // First pass: regular definitions, so composites can resolve their
    // referenced types.
    let mut regulars: Vec<IndexDefinition> = Vec::new();
    let mut composites: Vec<(usize, &Value)> = Vec::new();

    for (i, raw) in raw_types.iter().enumerate() {
        let Some(obj) = raw.as_object() else {
            errors.push(format!("types[{i}]: expected an object"));
            continue;
        };
        let has_rdf_type = obj.contains_key("rdf_type");
        let has_composite = obj.contains_key("composite_types");
        match (has_rdf_type, has_composite) {
            (true, true) => errors.push(format!(
                "types[{i}]: declares both rdf_type and composite_types"
            )),
            (false, false) => errors.push(format!(
                "types[{i}]: declares neither rdf_type nor composite_types"
            )),
            (true, false) => {
                if let Some(def) = lower_regular(i, raw, errors) {
                    regulars.push(def);
                }
            }
            (false, true) => composites.push((i, raw)),
        }
    }

    let mut definitions = regulars;

    for (i, raw) in composites {
        if let Some(def) = lower_composite(i, raw, &definitions, errors) {
            definitions.push(def);
        }
    }

    validate_uniqueness(&definitions, errors);
    definitions
}

fn validate_uniqueness(definitions: &[IndexDefinition], errors: &mut Vec<String>) {
    let mut names: Vec<&str> = Vec::new();
    let mut paths: Vec<&str> = Vec::new();
    for def in definitions {
        if names.contains(&def.name.as_str()) {
            errors.push(format!("duplicate index type name: {}", def.name));
        } else {
            names.push(&def.name);
        }
        if paths.contains(&def.on_path.as_str()) {
            errors.push(format!("duplicate on_path: {}", def.on_path));
        } else {
            paths.push(&def.on_path);
        }
    }
}

fn required_str<'a>(
    raw: &'a Value,
    key: &str,
    context: &str,
    errors: &mut Vec<String>,
) -> Option<&'a str> {
    match raw.get(key).and_then(Value::as_str) {
        Some(s) => Some(s),
        None => {
            errors.push(format!("{context}: missing string key {key}"));
            None
        }
    }
}

/// Accept a single IRI string or an array of IRI strings.
fn string_or_list(value: &Value, context: &str, errors: &mut Vec<String>) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => errors.push(format!("{context}: expected a string, got {item}")),
                }
            }
            out
        }
        other => {
            errors.push(format!("{context}: expected string or list, got {other}"));
            Vec::new()
        }
    }
}

fn lower_regular(i: usize, raw: &Value, errors: &mut Vec<String>) -> Option<IndexDefinition> {
    let context = format!("types[{i}]");
    let name = required_str(raw, "type", &context, errors)?.to_string();
    let on_path = required_str(raw, "on_path", &context, errors)?.to_string();

    let rdf_types = string_or_list(
        raw.get("rdf_type").expect("checked by caller"),
        &format!("{context}.rdf_type"),
        errors,
    );
    if rdf_types.is_empty() {
        errors.push(format!("{context}: rdf_type resolves to no types"));
    }

    let mut properties = match raw.get("properties") {
        Some(Value::Object(map)) => {
            let mut props = Vec::with_capacity(map.len());
            for (prop_name, spec) in map {
                if let Some(prop) =
                    lower_property(prop_name, spec, &format!("{context}.properties"), errors)
                {
                    props.push(prop);
                }
            }
            props
        }
        Some(other) => {
            errors.push(format!(
                "{context}.properties: expected an object, got {other}"
            ));
            Vec::new()
        }
        None => Vec::new(),
    };
    inject_uuid(&mut properties);

    Some(IndexDefinition {
        name,
        on_path,
        kind: IndexKind::Regular(RegularIndex {
            rdf_types,
            properties,
        }),
        mappings: raw.get("mappings").cloned(),
        settings: raw.get("settings").cloned(),
    })
}

fn lower_property(
    name: &str,
    spec: &Value,
    context: &str,
    errors: &mut Vec<String>,
) -> Option<PropertyDefinition> {
    let context = format!("{context}.{name}");
    match spec {
        Value::String(_) | Value::Array(_) => {
            let path = lower_path(spec, &context, errors)?;
            Some(PropertyDefinition {
                name: name.to_string(),
                path,
                kind: PropertyKind::Simple,
            })
        }
        Value::Object(obj) => {
            let via = obj.get("via").or_else(|| obj.get("path"));
            let Some(via) = via else {
                errors.push(format!("{context}: property object needs a via path"));
                return None;
            };
            let path = lower_path(via, &context, errors)?;
            let kind = lower_property_kind(obj, &context, errors)?;
            Some(PropertyDefinition {
                name: name.to_string(),
                path,
                kind,
            })
        }
        other => {
            errors.push(format!(
                "{context}: expected string, list or object, got {other}"
            ));
            None
        }
    }
}

fn lower_property_kind(
    obj: &serde_json::Map<String, Value>,
    context: &str,
    errors: &mut Vec<String>,
) -> Option<PropertyKind> {
    let declared = obj.get("type").and_then(Value::as_str);
    match declared {
        Some("simple") | None if obj.contains_key("properties") => {
            // A nested projection may omit the explicit type marker.
            lower_nested(obj, context, errors)
        }
        Some("nested") => lower_nested(obj, context, errors),
        Some("attachment") => Some(PropertyKind::Attachment {
            pipeline: obj
                .get("attachment_pipeline")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        Some("language-string") => Some(PropertyKind::LanguageString),
        Some("lambert-72") => Some(PropertyKind::Lambert72),
        Some("simple") => Some(PropertyKind::Simple),
        Some(other) => {
            errors.push(format!("{context}: unknown property type {other:?}"));
            None
        }
        None if obj.contains_key("attachment_pipeline") => Some(PropertyKind::Attachment {
            pipeline: obj
                .get("attachment_pipeline")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        None => Some(PropertyKind::Simple),
    }
}

fn lower_nested(
    obj: &serde_json::Map<String, Value>,
    context: &str,
    errors: &mut Vec<String>,
) -> Option<PropertyKind> {
    let sub_properties = match obj.get("properties") {
        Some(Value::Object(map)) => {
            let mut props = Vec::with_capacity(map.len());
            for (sub_name, spec) in map {
                if let Some(prop) = lower_property(sub_name, spec, context, errors) {
                    props.push(prop);
                }
            }
            props
        }
        Some(other) => {
            errors.push(format!("{context}.properties: expected an object, got {other}"));
            return None;
        }
        None => {
            errors.push(format!("{context}: nested property needs sub-properties"));
            return None;
        }
    };
    Some(PropertyKind::Nested {
        rdf_type: obj.get("rdf_type").and_then(Value::as_str).map(str::to_string),
        sub_properties,
    })
}

fn lower_path(value: &Value, context: &str, errors: &mut Vec<String>) -> Option<Vec<PathElement>> {
    let steps = string_or_list(value, context, errors);
    if steps.is_empty() {
        errors.push(format!("{context}: empty property path"));
        return None;
    }
    if steps.iter().any(|s| s.is_empty() || s == "^") {
        errors.push(format!("{context}: blank path step"));
        return None;
    }
    Some(steps.iter().map(|s| PathElement::parse(s)).collect())
}

fn lower_composite(
    i: usize,
    raw: &Value,
    regulars: &[IndexDefinition],
    errors: &mut Vec<String>,
) -> Option<IndexDefinition> {
    let context = format!("types[{i}]");
    let name = required_str(raw, "type", &context, errors)?.to_string();
    let on_path = required_str(raw, "on_path", &context, errors)?.to_string();

    let referenced = string_or_list(
        raw.get("composite_types").expect("checked by caller"),
        &format!("{context}.composite_types"),
        errors,
    );

    // Composite properties must be a list of {name, mappings?} objects.
    let composite_props = match raw.get("properties") {
        Some(Value::Array(items)) => {
            let mut props: Vec<(String, Option<&serde_json::Map<String, Value>>)> = Vec::new();
            for (j, item) in items.iter().enumerate() {
                let entry_context = format!("{context}.properties[{j}]");
                let Some(obj) = item.as_object() else {
                    errors.push(format!("{entry_context}: expected a {{name, mappings?}} object"));
                    continue;
                };
                let Some(prop_name) = obj.get("name").and_then(Value::as_str) else {
                    errors.push(format!("{entry_context}: missing string key name"));
                    continue;
                };
                let mappings = match obj.get("mappings") {
                    None => None,
                    Some(Value::Object(m)) => Some(m),
                    Some(other) => {
                        errors.push(format!(
                            "{entry_context}.mappings: expected an object, got {other}"
                        ));
                        continue;
                    }
                };
                props.push((prop_name.to_string(), mappings));
            }
            props
        }
        Some(other) => {
            errors.push(format!(
                "{context}.properties: composite properties must be a list of {{name, mappings?}} objects, got {other}"
            ));
            Vec::new()
        }
        None => Vec::new(),
    };

    let mut sub_indexes = Vec::with_capacity(referenced.len());
    for type_name in &referenced {
        let Some(source) = regulars.iter().find(|d| &d.name == type_name) else {
            errors.push(format!(
                "{context}: composite references unknown type {type_name}"
            ));
            continue;
        };
        let IndexKind::Regular(regular) = &source.kind else {
            errors.push(format!(
                "{context}: composite references non-regular type {type_name}"
            ));
            continue;
        };

        let mut properties = Vec::new();
        for (prop_name, mappings) in &composite_props {
            let source_name = mappings
                .and_then(|m| m.get(type_name.as_str()))
                .and_then(Value::as_str)
                .unwrap_or(prop_name);
            if let Some(prop) = regular.properties.iter().find(|p| p.name == *source_name) {
                let mut prop = prop.clone();
                prop.name = prop_name.clone();
                properties.push(prop);
            }
        }
        inject_uuid(&mut properties);

        sub_indexes.push(SubIndex {
            source_type: type_name.clone(),
            rdf_types: regular.rdf_types.clone(),
            properties,
        });
    }

    Some(IndexDefinition {
        name,
        on_path,
        kind: IndexKind::Composite(CompositeIndex { sub_indexes }),
        mappings: raw.get("mappings").cloned(),
        settings: raw.get("settings").cloned(),
    })
}
