//! Update handler coalescing: repeated submissions for one subject
//! collapse, distinct subjects run independently, and drain waits for
//! the queue to empty.

mod support;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{harness_with, prop_triple, scope_of, Answer, MockSearch};
use trellis_client::SparqlTerm;
use trellis_indexer::UpdateHandler;

fn document_config() -> serde_json::Value {
    json!({
        "types": [{
            "type": "document",
            "on_path": "documents",
            "rdf_type": "http://e/Foo",
            "properties": {"title": "http://purl.org/dc/terms/title"}
        }]
    })
}

fn respond_for_subjects(h: &support::Harness) {
    h.sparql
        .respond(|q| q.starts_with("ASK").then(|| Answer::Bool(true)));
    h.sparql.respond(|q| {
        if !q.starts_with("CONSTRUCT") {
            return None;
        }
        let subject = if q.contains("<http://e/a>") { "a" } else { "b" };
        Some(Answer::Triples(vec![
            prop_triple("uuid", SparqlTerm::literal(format!("uuid-{subject}"))),
            prop_triple("title", SparqlTerm::literal("hello")),
        ]))
    });
}

#[tokio::test]
async fn repeated_submissions_coalesce() {
    // Slow backend writes widen the window in which resubmissions land.
    let h = harness_with(document_config(), MockSearch::with_delay(Duration::from_millis(20)));
    respond_for_subjects(&h);

    let scope = scope_of(&[]);
    let index = h.manager.ensure_index("document", &scope, &scope, false).await;

    let updates = UpdateHandler::new(Arc::clone(&h.manager));
    for _ in 0..5 {
        updates.submit("http://e/a", "document");
    }
    updates.drain().await;
    assert_eq!(updates.pending(), 0);

    // Five submissions reach the backend as at most two passes (the
    // running pass plus one dirty re-run), never five.
    let upserts = h
        .search
        .op_log()
        .iter()
        .filter(|op| op.starts_with("upsert:"))
        .count();
    assert!(upserts >= 1 && upserts <= 2, "got {upserts} upserts");

    let docs = h.search.documents(index.name());
    assert_eq!(docs["uuid-a"]["title"], json!("hello"));
}

#[tokio::test]
async fn distinct_subjects_are_processed_independently() {
    let h = harness_with(document_config(), MockSearch::new());
    respond_for_subjects(&h);

    let scope = scope_of(&[]);
    let index = h.manager.ensure_index("document", &scope, &scope, false).await;

    let updates = UpdateHandler::new(Arc::clone(&h.manager));
    updates.submit("http://e/a", "document");
    updates.submit("http://e/b", "document");
    updates.drain().await;

    let docs = h.search.documents(index.name());
    assert_eq!(docs.len(), 2);
    assert!(docs.contains_key("uuid-a"));
    assert!(docs.contains_key("uuid-b"));
}

#[tokio::test]
async fn shutdown_refuses_further_work() {
    let h = harness_with(document_config(), MockSearch::new());
    respond_for_subjects(&h);

    let scope = scope_of(&[]);
    let index = h.manager.ensure_index("document", &scope, &scope, false).await;

    let updates = UpdateHandler::new(Arc::clone(&h.manager));
    updates.submit("http://e/a", "document");
    updates.shutdown().await;

    updates.submit("http://e/b", "document");
    updates.drain().await;

    let docs = h.search.documents(index.name());
    assert!(docs.contains_key("uuid-a"));
    assert!(!docs.contains_key("uuid-b"));
}
