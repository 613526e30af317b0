//! Persisted index metadata.
//!
//! The triplestore is the source of truth for which indexes exist.
//! Every index is recorded in the reserved metadata graph as
//!
//! ```text
//! <index_uri> a search:ElasticsearchIndex ;
//!    mu:uuid "<v4>" ;
//!    search:objectType "<type_name>" ;
//!    search:hasAllowedGroup "<json group>", … ;
//!    search:hasUsedGroup   "<json group>", … ;
//!    search:indexName      "<name>" .
//! ```
//!
//! All reads and writes here run under the privileged sudo context.

use crate::error::Result;
use trellis_auth::{AccessGroup, AccessScope};
use trellis_client::{escape_string, SparqlPool, TermKind};
use trellis_vocab::{graphs, mu, search};
use uuid::Uuid;

use crate::index::SearchIndex;

/// Index identity restored from the metadata graph.
#[derive(Debug, Clone)]
pub struct PersistedIndex {
    pub uri: String,
    pub name: String,
    pub type_name: String,
    pub allowed_groups: AccessScope,
    pub used_groups: AccessScope,
}

fn group_literal(group: &AccessGroup) -> String {
    format!("\"{}\"", escape_string(&group.canonical_json()))
}

/// Upsert the metadata triples for an index. Existing triples for the
/// same index name are replaced.
pub async fn persist_index(pool: &SparqlPool, index: &SearchIndex) -> Result<()> {
    let uuid = Uuid::new_v4();
    let mut triples = vec![
        format!("<{}> a <{}>", index.uri(), search::ELASTICSEARCH_INDEX),
        format!("<{}> <{}> \"{}\"", index.uri(), mu::UUID, uuid),
        format!(
            "<{}> <{}> \"{}\"",
            index.uri(),
            search::OBJECT_TYPE,
            escape_string(index.type_name())
        ),
        format!(
            "<{}> <{}> \"{}\"",
            index.uri(),
            search::INDEX_NAME,
            index.name()
        ),
    ];
    for group in index.allowed_groups().groups() {
        triples.push(format!(
            "<{}> <{}> {}",
            index.uri(),
            search::HAS_ALLOWED_GROUP,
            group_literal(group)
        ));
    }
    for group in index.used_groups().groups() {
        triples.push(format!(
            "<{}> <{}> {}",
            index.uri(),
            search::HAS_USED_GROUP,
            group_literal(group)
        ));
    }

    let update = format!(
        "DELETE WHERE {{ GRAPH <{graph}> {{ <{uri}> ?p ?o }} }} ;\n\
         INSERT DATA {{ GRAPH <{graph}> {{ {triples} . }} }}",
        graph = graphs::INDEXES,
        uri = index.uri(),
        triples = triples.join(" .\n    "),
    );
    pool.sudo_update(&update).await?;
    Ok(())
}

/// Load every persisted index of one configured type.
pub async fn load_indexes_for_type(pool: &SparqlPool, type_name: &str) -> Result<Vec<PersistedIndex>> {
    let query = format!(
        "SELECT ?index ?name WHERE {{\n\
         \u{20} GRAPH <{graph}> {{\n\
         \u{20}   ?index a <{class}> ;\n\
         \u{20}     <{object_type}> \"{type_name}\" ;\n\
         \u{20}     <{index_name}> ?name .\n\
         \u{20} }}\n\
         }}",
        graph = graphs::INDEXES,
        class = search::ELASTICSEARCH_INDEX,
        object_type = search::OBJECT_TYPE,
        index_name = search::INDEX_NAME,
        type_name = escape_string(type_name),
    );
    let response = pool.sudo_query(&query).await?;

    let mut indexes = Vec::new();
    for row in &response.results.bindings {
        let (Some(uri), Some(name)) = (row.get("index"), row.get("name")) else {
            continue;
        };
        let allowed = load_groups(pool, &uri.value, search::HAS_ALLOWED_GROUP).await?;
        let used = load_groups(pool, &uri.value, search::HAS_USED_GROUP).await?;
        indexes.push(PersistedIndex {
            uri: uri.value.clone(),
            name: name.value.clone(),
            type_name: type_name.to_string(),
            allowed_groups: allowed,
            used_groups: used,
        });
    }
    Ok(indexes)
}

async fn load_groups(pool: &SparqlPool, index_uri: &str, predicate: &str) -> Result<AccessScope> {
    let query = format!(
        "SELECT ?group WHERE {{ GRAPH <{graph}> {{ <{index_uri}> <{predicate}> ?group }} }}",
        graph = graphs::INDEXES,
    );
    let response = pool.sudo_query(&query).await?;
    let mut groups = Vec::new();
    for term in response.column("group") {
        match serde_json::from_str::<AccessGroup>(&term.value) {
            Ok(group) => groups.push(group),
            Err(e) => {
                tracing::warn!(
                    target: "index_mgmt",
                    index = index_uri,
                    value = %term.value,
                    error = %e,
                    "skipping unparseable persisted group"
                );
            }
        }
    }
    Ok(AccessScope::new(groups))
}

/// Backend names of every persisted index, across all types.
pub async fn load_all_index_names(pool: &SparqlPool) -> Result<Vec<String>> {
    let query = format!(
        "SELECT ?name WHERE {{\n\
         \u{20} GRAPH <{graph}> {{ ?index a <{class}> ; <{index_name}> ?name }}\n\
         }}",
        graph = graphs::INDEXES,
        class = search::ELASTICSEARCH_INDEX,
        index_name = search::INDEX_NAME,
    );
    let response = pool.sudo_query(&query).await?;
    Ok(response
        .column("name")
        .filter(|t| t.kind != TermKind::Uri)
        .map(|t| t.value.clone())
        .collect())
}

/// Remove the metadata of one index by backend name.
pub async fn remove_index_metadata(pool: &SparqlPool, name: &str) -> Result<()> {
    let update = format!(
        "DELETE {{ GRAPH <{graph}> {{ ?index ?p ?o }} }}\n\
         WHERE {{ GRAPH <{graph}> {{ ?index <{index_name}> \"{name}\" ; ?p ?o }} }}",
        graph = graphs::INDEXES,
        index_name = search::INDEX_NAME,
        name = escape_string(name),
    );
    pool.sudo_update(&update).await?;
    Ok(())
}

/// Remove the metadata of every persisted index.
pub async fn remove_all_metadata(pool: &SparqlPool) -> Result<()> {
    let update = format!(
        "DELETE {{ GRAPH <{graph}> {{ ?index ?p ?o }} }}\n\
         WHERE {{ GRAPH <{graph}> {{ ?index a <{class}> ; ?p ?o }} }}",
        graph = graphs::INDEXES,
        class = search::ELASTICSEARCH_INDEX,
    );
    pool.sudo_update(&update).await?;
    Ok(())
}
