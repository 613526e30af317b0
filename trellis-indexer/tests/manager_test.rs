//! Index manager behavior: eager covering, exact-match synthesis,
//! identity stability and rebuild linearization.

mod support;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{harness, harness_with, prop_triple, row, scope_of, Answer, MockSearch};
use trellis_client::{SearchClient, SparqlTerm};
use trellis_indexer::IndexStatus;

fn document_config_with(extra: serde_json::Value) -> serde_json::Value {
    let mut config = json!({
        "types": [{
            "type": "document",
            "on_path": "documents",
            "rdf_type": "http://e/Foo",
            "properties": {"title": "http://purl.org/dc/terms/title"}
        }]
    });
    config
        .as_object_mut()
        .unwrap()
        .extend(extra.as_object().unwrap().clone());
    config
}

/// Respond to the bulk-indexing queries with `count` resources named
/// `http://e/r{i}`, each carrying a uuid and a title.
fn respond_with_resources(h: &support::Harness, count: usize) {
    h.sparql.respond(move |q| {
        q.contains("COUNT(DISTINCT ?s)").then(|| {
            Answer::Rows(vec![row(
                "count",
                SparqlTerm::literal(count.to_string()),
            )])
        })
    });
    h.sparql.respond(move |q| {
        q.contains("SELECT DISTINCT ?s").then(|| {
            Answer::Rows(
                (0..count)
                    .map(|i| row("s", SparqlTerm::uri(format!("http://e/r{i}"))))
                    .collect(),
            )
        })
    });
    h.sparql.respond(|q| {
        if !q.starts_with("CONSTRUCT") {
            return None;
        }
        let uri = q
            .lines()
            .find_map(|line| {
                let line = line.trim();
                line.strip_prefix("{ <http://e/r")
                    .map(|rest| rest.split('>').next().unwrap_or_default().to_string())
            })
            .unwrap_or_default();
        Some(Answer::Triples(vec![
            prop_triple("uuid", SparqlTerm::literal(format!("uuid-r{uri}"))),
            prop_triple("title", SparqlTerm::literal("hello")),
        ]))
    });
}

#[tokio::test]
async fn eager_indexes_cover_a_combined_caller() {
    let h = harness(document_config_with(json!({
        "eager_indexing_groups": [
            [{"group": "editor", "variables": []}],
            [{"group": "reader", "variables": []}]
        ]
    })));
    respond_with_resources(&h, 0);

    h.manager.initialize().await;

    let eager = h.manager.registry().find_for_type("document");
    assert_eq!(eager.len(), 2);
    assert!(eager.iter().all(|i| i.is_eager()));
    assert!(eager.iter().all(|i| i.status() == IndexStatus::Valid));

    // A caller granted both groups is answered by the two eager
    // indexes; no new index is synthesised.
    let fetched = h
        .manager
        .fetch_indexes(Some("document"), Some(&scope_of(&["reader", "editor"])), false)
        .await;
    assert_eq!(fetched.len(), 2);
    assert!(fetched.iter().all(|i| i.is_eager()));
    assert_eq!(h.manager.registry().find_for_type("document").len(), 2);
}

#[tokio::test]
async fn unmatched_caller_gets_an_exact_index() {
    let h = harness(document_config_with(json!({
        "eager_indexing_groups": [[{"group": "reader", "variables": []}]]
    })));
    respond_with_resources(&h, 1);

    h.manager.initialize().await;

    let caller = scope_of(&["other"]);
    let fetched = h
        .manager
        .fetch_indexes(Some("document"), Some(&caller), false)
        .await;

    assert_eq!(fetched.len(), 1);
    let index = &fetched[0];
    assert!(!index.is_eager());
    assert_eq!(index.allowed_groups(), &caller);
    assert_eq!(index.status(), IndexStatus::Valid);
    // The rebuilt index holds exactly the resources visible under the
    // caller's authorization.
    assert_eq!(h.search.documents(index.name()).len(), 1);
}

#[tokio::test]
async fn ensure_returns_the_same_index_for_canonically_equal_scopes() {
    let h = harness(document_config_with(json!({})));

    let a = h
        .manager
        .ensure_index("document", &scope_of(&["x", "y"]), &scope_of(&["x", "y"]), false)
        .await;
    let b = h
        .manager
        .ensure_index("document", &scope_of(&["y", "x"]), &scope_of(&["y", "x"]), false)
        .await;

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(h.manager.registry().find_for_type("document").len(), 1);
}

#[tokio::test]
async fn subset_indexes_are_discarded_from_the_cover() {
    let h = harness(document_config_with(json!({
        "eager_indexing_groups": [
            [{"group": "reader", "variables": []}],
            [{"group": "reader", "variables": []}, {"group": "editor", "variables": []}]
        ]
    })));
    respond_with_resources(&h, 0);

    h.manager.initialize().await;

    // The {reader} index is a strict subset of {reader, editor} and
    // contributes nothing to the cover.
    let fetched = h
        .manager
        .fetch_indexes(Some("document"), Some(&scope_of(&["reader", "editor"])), false)
        .await;
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].allowed_groups(), &scope_of(&["reader", "editor"]));
}

#[tokio::test]
async fn force_update_rebuilds_valid_indexes() {
    let h = harness(document_config_with(json!({})));
    respond_with_resources(&h, 0);

    let scope = scope_of(&["reader"]);
    let index = h.manager.ensure_index("document", &scope, &scope, false).await;
    h.manager.update_index(&index).await;
    assert_eq!(index.status(), IndexStatus::Valid);
    let rebuilds_before = count_ops(&h.search, "clear:");

    h.manager
        .fetch_indexes(Some("document"), None, true)
        .await;
    assert_eq!(count_ops(&h.search, "clear:"), rebuilds_before + 1);
}

#[tokio::test]
async fn concurrent_updates_are_linearised() {
    let search = MockSearch::with_delay(Duration::from_millis(5));
    let h = harness_with(document_config_with(json!({})), search);
    respond_with_resources(&h, 1);

    let scope = scope_of(&[]);
    let index = h.manager.ensure_index("document", &scope, &scope, false).await;

    tokio::join!(
        h.manager.update_index(&index),
        h.manager.update_index(&index)
    );

    // Each rebuild runs clear → bulk → refresh without interleaving:
    // the backend is never truncated while the other rebuild inserts.
    let ops: Vec<String> = h
        .search
        .op_log()
        .into_iter()
        .filter(|op| {
            op.starts_with("clear:") || op.starts_with("bulk:") || op.starts_with("refresh:")
        })
        .map(|op| op.split(':').next().unwrap().to_string())
        .collect();
    assert_eq!(ops, vec!["clear", "bulk", "refresh", "clear", "bulk", "refresh"]);
    assert_eq!(index.status(), IndexStatus::Valid);
}

#[tokio::test]
async fn initialize_without_persistence_purges_stale_indexes() {
    let h = harness(document_config_with(json!({})));

    // One index survived an earlier run in the metadata graph.
    h.sparql.respond(|q| {
        q.contains("?name").then(|| {
            Answer::Rows(vec![row("name", SparqlTerm::literal("stale-index"))])
        })
    });

    h.manager.initialize().await;

    // The backend index is deleted per name, the metadata in one
    // graph-scoped sweep.
    assert!(h
        .search
        .op_log()
        .contains(&"delete_index:stale-index".to_string()));
    assert!(h
        .sparql
        .updates
        .lock()
        .unwrap()
        .iter()
        .any(|u| u.contains("ElasticsearchIndex") && !u.contains("INSERT")));
}

#[tokio::test]
async fn remove_deletes_backend_metadata_and_registry_entry() {
    let h = harness(document_config_with(json!({})));

    let scope = scope_of(&["reader"]);
    let index = h.manager.ensure_index("document", &scope, &scope, false).await;
    assert!(h.search.index_exists(index.name()).await.unwrap());

    let removed = h.manager.remove_indexes(Some("document")).await;
    assert_eq!(removed, 1);
    assert_eq!(index.status(), IndexStatus::Deleted);
    assert!(!h.search.index_exists(index.name()).await.unwrap());
    assert!(h.manager.registry().find_for_type("document").is_empty());
    // Metadata removal was issued against the triplestore (a pure
    // DELETE, unlike the DELETE-then-INSERT upsert).
    assert!(h
        .sparql
        .updates
        .lock()
        .unwrap()
        .iter()
        .any(|u| u.contains(index.name()) && !u.contains("INSERT")));
}

fn count_ops(search: &MockSearch, prefix: &str) -> usize {
    search
        .op_log()
        .iter()
        .filter(|op| op.starts_with(prefix))
        .count()
}
