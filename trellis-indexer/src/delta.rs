//! Delta processing.
//!
//! The triplestore emits change notifications as arrays of changesets
//! (format 0.0.1). For every changed triple the processor determines
//! which configured index types are affected, resolves the *root
//! subjects* whose projected documents depend on the triple, and feeds
//! `(subject, type)` work items to the update handler.
//!
//! A triple affects a type either directly (`rdf:type` changes whose
//! object is one of the type's configured classes) or through the
//! property-path cache (any path containing the predicate, forward or
//! inverse). For path hits the roots are resolved with one SPARQL query
//! per path occurrence, walking the path prefix backwards from the
//! changed triple. These queries run under the privileged sudo context:
//! which callers may see the result is decided later, per index, by the
//! update handler.

use crate::manager::IndexManager;
use crate::update::UpdateHandler;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use trellis_client::{SparqlTerm, TermKind};
use trellis_config::{path_to_sparql, PathOccurrence};
use trellis_vocab::rdf;

/// One changeset of a delta notification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeltaChangeset {
    #[serde(default)]
    pub inserts: Vec<DeltaTriple>,
    #[serde(default)]
    pub deletes: Vec<DeltaTriple>,
}

/// One changed triple.
#[derive(Debug, Clone, Deserialize)]
pub struct DeltaTriple {
    pub subject: DeltaTerm,
    pub predicate: DeltaTerm,
    pub object: DeltaTerm,
}

/// One term of a changed triple.
#[derive(Debug, Clone, Deserialize)]
pub struct DeltaTerm {
    pub value: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub datatype: Option<String>,
    #[serde(default, rename = "xml:lang", alias = "lang")]
    pub lang: Option<String>,
}

impl DeltaTerm {
    fn is_literal(&self) -> bool {
        matches!(
            self.kind.as_deref(),
            Some("literal") | Some("typed-literal")
        ) || (self.kind.is_none() && (self.datatype.is_some() || self.lang.is_some()))
    }

    /// Convert to a result term for SPARQL rendering. Terms without an
    /// explicit kind are treated as URIs, matching how subjects and
    /// predicates are emitted.
    fn to_term(&self) -> SparqlTerm {
        let kind = match self.kind.as_deref() {
            Some("literal") => TermKind::Literal,
            Some("typed-literal") => TermKind::TypedLiteral,
            Some("bnode") => TermKind::Bnode,
            Some("triple") => TermKind::Triple,
            Some("uri") => TermKind::Uri,
            Some(_) | None => {
                if self.is_literal() {
                    TermKind::Literal
                } else {
                    TermKind::Uri
                }
            }
        };
        SparqlTerm {
            kind,
            value: self.value.clone(),
            datatype: self.datatype.clone(),
            lang: self.lang.clone(),
        }
    }
}

/// Consumes delta notifications and queues document updates.
pub struct DeltaProcessor {
    manager: Arc<IndexManager>,
    updates: Arc<UpdateHandler>,
    sender: Mutex<Option<mpsc::UnboundedSender<Vec<DeltaChangeset>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeltaProcessor {
    /// Create the processor and start its consumer task. Deltas are
    /// processed in arrival order by a single consumer; root resolution
    /// for one delta completes before the next delta starts, which
    /// preserves per-subject ordering.
    pub fn new(manager: Arc<IndexManager>, updates: Arc<UpdateHandler>) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let processor = Arc::new(Self {
            manager,
            updates,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(None),
        });
        let handle = tokio::spawn(Self::consume(Arc::clone(&processor), receiver));
        *processor.worker.lock().expect("delta worker lock poisoned") = Some(handle);
        processor
    }

    /// Append a delta notification to the queue.
    pub fn submit(&self, changesets: Vec<DeltaChangeset>) {
        let sender = self.sender.lock().expect("delta sender lock poisoned");
        let delivered = sender
            .as_ref()
            .map(|tx| tx.send(changesets).is_ok())
            .unwrap_or(false);
        if !delivered {
            tracing::warn!(target: "delta", "delta dropped, processor is shut down");
        }
    }

    /// Stop accepting deltas and wait for the queue to empty.
    pub async fn shutdown(&self) {
        self.sender.lock().expect("delta sender lock poisoned").take();
        let handle = self.worker.lock().expect("delta worker lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(target: "delta", error = %e, "delta consumer ended abnormally");
            }
        }
    }

    async fn consume(
        processor: Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<Vec<DeltaChangeset>>,
    ) {
        while let Some(changesets) = receiver.recv().await {
            if let Err(e) = processor.process(changesets).await {
                tracing::warn!(target: "delta", error = %e, "delta processing failed; continuing");
            }
        }
    }

    /// Process one delta notification.
    pub async fn process(&self, changesets: Vec<DeltaChangeset>) -> crate::error::Result<()> {
        if !self.manager.config().settings.automatic_index_updates {
            // Updates are disabled: invalidate the affected types so
            // the next fetch rebuilds them.
            let mut affected: HashSet<String> = HashSet::new();
            for changeset in &changesets {
                for triple in changeset.deletes.iter().chain(&changeset.inserts) {
                    affected.extend(self.affected_types(triple).into_iter().map(String::from));
                }
            }
            for type_name in affected {
                self.manager.invalidate_indexes(Some(&type_name)).await;
            }
            return Ok(());
        }

        for changeset in changesets {
            for triple in &changeset.deletes {
                self.dispatch_triple(triple, false).await;
            }
            for triple in &changeset.inserts {
                self.dispatch_triple(triple, true).await;
            }
        }
        Ok(())
    }

    /// Index types affected by a triple.
    fn affected_types<'a>(&'a self, triple: &DeltaTriple) -> Vec<&'a str> {
        let cache = self.manager.config().path_cache();
        if triple.predicate.value == rdf::TYPE {
            cache
                .types_for_rdf_type(&triple.object.value)
                .iter()
                .map(String::as_str)
                .collect()
        } else {
            cache.types_for_predicate(&triple.predicate.value)
        }
    }

    async fn dispatch_triple(&self, triple: &DeltaTriple, is_addition: bool) {
        if triple.predicate.value == rdf::TYPE {
            // The subject itself is the root for every affected type.
            for type_name in self.affected_types(triple) {
                self.updates.submit(&triple.subject.value, type_name);
            }
            return;
        }

        let cache = self.manager.config().path_cache();
        let occurrences: Vec<PathOccurrence> =
            cache.occurrences(&triple.predicate.value).to_vec();
        for occurrence in occurrences {
            match self.resolve_roots(&occurrence, triple, is_addition).await {
                Ok(roots) => {
                    for root in roots {
                        self.updates.submit(root, &occurrence.type_name);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        target: "delta",
                        predicate = %triple.predicate.value,
                        r#type = %occurrence.type_name,
                        error = %e,
                        "root resolution failed"
                    );
                }
            }
        }
    }

    /// Resolve the root subjects whose document depends on this triple
    /// through one path occurrence.
    ///
    /// For additions the query requires the triple itself and, when the
    /// occurrence is not terminal, the path suffix. For deletions the
    /// triple is gone from the store, so both checks are skipped; the
    /// resulting over-approximation only costs a redundant update.
    async fn resolve_roots(
        &self,
        occurrence: &PathOccurrence,
        triple: &DeltaTriple,
        is_addition: bool,
    ) -> crate::error::Result<HashSet<String>> {
        let element = occurrence.element();

        // A literal object can only sit at the end of a forward path.
        if triple.object.is_literal() && !occurrence.is_terminal() && !element.inverse {
            return Ok(HashSet::new());
        }

        let Some(definition) = self.manager.config().definition(&occurrence.type_name) else {
            return Ok(HashSet::new());
        };
        let type_filter = crate::builder::type_filter(definition);

        // The prefix of the path reaches the triple's subject side for
        // forward steps and its object side for inverse steps.
        let (start, continuation) = if element.inverse {
            (&triple.object, &triple.subject)
        } else {
            (&triple.subject, &triple.object)
        };

        let mut clauses = vec![
            "?s a ?type .".to_string(),
            format!("FILTER(?type IN ({type_filter})) ."),
        ];

        if occurrence.position == 0 {
            // The start of the path is the root itself.
            if start.is_literal() {
                return Ok(HashSet::new());
            }
            clauses.push(format!("VALUES ?s {{ {} }} .", start.to_term().to_sparql()));
        } else {
            clauses.push(format!(
                "?s {} {} .",
                path_to_sparql(occurrence.prefix()),
                start.to_term().to_sparql()
            ));
        }

        if is_addition {
            clauses.push(format!(
                "{} {} {} .",
                triple.subject.to_term().to_sparql(),
                triple.predicate.to_term().to_sparql(),
                triple.object.to_term().to_sparql()
            ));
            if !occurrence.is_terminal() {
                clauses.push(format!(
                    "{} {} ?end .",
                    continuation.to_term().to_sparql(),
                    path_to_sparql(occurrence.suffix())
                ));
            }
        }

        let query = format!(
            "SELECT DISTINCT ?s WHERE {{\n  {}\n}}",
            clauses.join("\n  ")
        );
        let response = self.manager.pool().sudo_query(&query).await?;
        Ok(response
            .column("s")
            .filter(|t| t.kind == TermKind::Uri)
            .map(|t| t.value.clone())
            .collect())
    }
}
