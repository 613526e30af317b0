//! In-memory collaborator fakes for integration tests.
//!
//! `MockSparql` answers queries through registered responders matched
//! against the query text; `MockSearch` is a real in-memory document
//! store recording its operation sequence.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use trellis_auth::AccessScope;
use trellis_client::{
    Authorization, AttachmentCache, BulkOperation, ConstructTriple, Result as ClientResult,
    ResultBindings, ResultHead, SearchClient, SelectResponse, SparqlClient, SparqlClientFactory,
    SparqlPool, SparqlTerm, TextExtractor,
};
use trellis_config::Configuration;
use trellis_indexer::{DocumentBuilder, IndexManager};

/// Answer returned by a responder.
pub enum Answer {
    Rows(Vec<HashMap<String, SparqlTerm>>),
    Bool(bool),
    Triples(Vec<ConstructTriple>),
}

type Responder = Box<dyn Fn(&str) -> Option<Answer> + Send + Sync>;

/// Programmable SPARQL endpoint fake.
#[derive(Default)]
pub struct MockSparql {
    responders: Mutex<Vec<Responder>>,
    /// (authorization, query) of every select/ask/construct.
    pub queries: Mutex<Vec<(String, String)>>,
    /// Every update statement received.
    pub updates: Mutex<Vec<String>>,
}

impl MockSparql {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a responder; the first one returning `Some` wins.
    pub fn respond(&self, responder: impl Fn(&str) -> Option<Answer> + Send + Sync + 'static) {
        self.responders
            .lock()
            .unwrap()
            .push(Box::new(responder));
    }

    pub fn query_log(&self) -> Vec<(String, String)> {
        self.queries.lock().unwrap().clone()
    }

    fn answer(&self, query: &str) -> Option<Answer> {
        let responders = self.responders.lock().unwrap();
        responders.iter().find_map(|r| r(query))
    }
}

struct MockSparqlClient {
    inner: Arc<MockSparql>,
    auth: String,
}

fn auth_label(authorization: &Authorization) -> String {
    match authorization {
        Authorization::Sudo => "sudo".to_string(),
        Authorization::Scope(scope) => scope.cache_key(),
    }
}

/// Factory wrapper so the mock can hand out clients referring back to
/// itself.
pub struct ArcMockSparql(pub Arc<MockSparql>);

impl SparqlClientFactory for ArcMockSparql {
    fn client(&self, authorization: Authorization) -> Arc<dyn SparqlClient> {
        Arc::new(MockSparqlClient {
            inner: Arc::clone(&self.0),
            auth: auth_label(&authorization),
        })
    }
}

#[async_trait]
impl SparqlClient for MockSparqlClient {
    async fn select(&self, sparql: &str) -> ClientResult<SelectResponse> {
        self.inner
            .queries
            .lock()
            .unwrap()
            .push((self.auth.clone(), sparql.to_string()));
        match self.inner.answer(sparql) {
            Some(Answer::Rows(bindings)) => Ok(SelectResponse {
                head: ResultHead { vars: Vec::new() },
                results: ResultBindings { bindings },
                boolean: None,
            }),
            Some(Answer::Bool(value)) => Ok(SelectResponse {
                head: ResultHead::default(),
                results: ResultBindings::default(),
                boolean: Some(value),
            }),
            _ => Ok(SelectResponse {
                head: ResultHead::default(),
                results: ResultBindings::default(),
                boolean: Some(false),
            }),
        }
    }

    async fn construct(&self, sparql: &str) -> ClientResult<Vec<ConstructTriple>> {
        self.inner
            .queries
            .lock()
            .unwrap()
            .push((self.auth.clone(), sparql.to_string()));
        match self.inner.answer(sparql) {
            Some(Answer::Triples(triples)) => Ok(triples),
            _ => Ok(Vec::new()),
        }
    }

    async fn update(&self, sparql: &str) -> ClientResult<()> {
        self.inner.updates.lock().unwrap().push(sparql.to_string());
        Ok(())
    }
}

/// A CONSTRUCT triple binding a property's synthetic subject to a
/// value.
pub fn prop_triple(name: &str, object: SparqlTerm) -> ConstructTriple {
    ConstructTriple {
        subject: SparqlTerm::uri(format!("http://mu.semte.ch/vocabularies/ext/{name}")),
        predicate: SparqlTerm::uri("http://mu.semte.ch/vocabularies/ext/value"),
        object,
    }
}

pub fn row(var: &str, term: SparqlTerm) -> HashMap<String, SparqlTerm> {
    HashMap::from([(var.to_string(), term)])
}

/// In-memory search backend recording its operation sequence.
#[derive(Default)]
pub struct MockSearch {
    pub state: Mutex<HashMap<String, HashMap<String, Value>>>,
    pub ops: Mutex<Vec<String>>,
    /// Artificial latency per operation, for interleaving tests.
    pub op_delay: Option<Duration>,
}

impl MockSearch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            op_delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn documents(&self, index: &str) -> HashMap<String, Value> {
        self.state
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn op_log(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    async fn record(&self, op: String) {
        if let Some(delay) = self.op_delay {
            tokio::time::sleep(delay).await;
        }
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl SearchClient for MockSearch {
    async fn create_index(
        &self,
        name: &str,
        _mappings: Option<&Value>,
        _settings: Option<&Value>,
    ) -> ClientResult<()> {
        self.record(format!("create:{name}")).await;
        self.state
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn index_exists(&self, name: &str) -> ClientResult<bool> {
        Ok(self.state.lock().unwrap().contains_key(name))
    }

    async fn delete_index(&self, name: &str) -> ClientResult<()> {
        self.record(format!("delete_index:{name}")).await;
        self.state.lock().unwrap().remove(name);
        Ok(())
    }

    async fn clear_index(&self, name: &str) -> ClientResult<()> {
        self.record(format!("clear:{name}")).await;
        if let Some(docs) = self.state.lock().unwrap().get_mut(name) {
            docs.clear();
        }
        Ok(())
    }

    async fn refresh_index(&self, name: &str) -> ClientResult<()> {
        self.record(format!("refresh:{name}")).await;
        Ok(())
    }

    async fn insert_document(&self, index: &str, id: &str, document: &Value) -> ClientResult<()> {
        self.record(format!("insert:{index}:{id}")).await;
        self.state
            .lock()
            .unwrap()
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), document.clone());
        Ok(())
    }

    async fn upsert_document(&self, index: &str, id: &str, document: &Value) -> ClientResult<()> {
        self.record(format!("upsert:{index}:{id}")).await;
        self.state
            .lock()
            .unwrap()
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), document.clone());
        Ok(())
    }

    async fn delete_document(&self, index: &str, id: &str) -> ClientResult<()> {
        self.record(format!("delete:{index}:{id}")).await;
        if let Some(docs) = self.state.lock().unwrap().get_mut(index) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn bulk(&self, index: &str, operations: &[BulkOperation]) -> ClientResult<()> {
        self.record(format!("bulk:{index}:{}", operations.len())).await;
        let mut state = self.state.lock().unwrap();
        let docs = state.entry(index.to_string()).or_default();
        for op in operations {
            match op {
                BulkOperation::Index { id, document } => {
                    docs.insert(id.clone(), document.clone());
                }
                BulkOperation::Delete { id } => {
                    docs.remove(id);
                }
            }
        }
        Ok(())
    }

    async fn search(&self, index: &str, query: &Value) -> ClientResult<Value> {
        let docs = self.documents(index);
        let uri_filter = query
            .pointer("/query/term/uri")
            .and_then(Value::as_str)
            .map(str::to_string);
        let hits: Vec<Value> = docs
            .iter()
            .filter(|(_, doc)| match &uri_filter {
                Some(uri) => doc.get("uri").and_then(Value::as_str) == Some(uri),
                None => true,
            })
            .map(|(id, doc)| serde_json::json!({"_id": id, "_source": doc}))
            .collect();
        Ok(serde_json::json!({"hits": {"total": {"value": hits.len()}, "hits": hits}}))
    }

    async fn count(&self, index: &str, _query: &Value) -> ClientResult<u64> {
        Ok(self.documents(index).len() as u64)
    }

    async fn upload_attachment(
        &self,
        index: &str,
        id: &str,
        _pipeline: &str,
        document: &Value,
    ) -> ClientResult<()> {
        self.upsert_document(index, id, document).await
    }
}

/// Extractor fake recording its calls.
#[derive(Default)]
pub struct MockExtractor {
    pub calls: Mutex<Vec<String>>,
    pub text: Option<String>,
}

impl MockExtractor {
    pub fn returning(text: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            text: Some(text.to_string()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TextExtractor for MockExtractor {
    async fn extract_text(&self, path: &Path, _blob: &[u8]) -> ClientResult<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .push(path.display().to_string());
        Ok(self.text.clone())
    }
}

/// Fully wired manager over the fakes. The returned tempdir owns the
/// attachment cache directory and must stay alive for the test.
pub struct Harness {
    pub config: Arc<Configuration>,
    pub sparql: Arc<MockSparql>,
    pub search: Arc<MockSearch>,
    pub extractor: Arc<MockExtractor>,
    pub manager: Arc<IndexManager>,
    pub tempdir: tempfile::TempDir,
}

pub fn harness(config_json: Value) -> Harness {
    harness_with(config_json, MockSearch::new())
}

pub fn harness_with(config_json: Value, search: Arc<MockSearch>) -> Harness {
    let config = Arc::new(Configuration::from_value(config_json).expect("test configuration"));
    let sparql = MockSparql::new();
    let extractor = MockExtractor::returning("extracted text");
    let tempdir = tempfile::tempdir().expect("tempdir");

    let pool = Arc::new(SparqlPool::new(
        Arc::new(ArcMockSparql(Arc::clone(&sparql))),
        4,
    ));
    let documents = Arc::new(DocumentBuilder::new(
        &config.settings,
        extractor.clone() as Arc<dyn TextExtractor>,
        AttachmentCache::new(tempdir.path().join("cache")),
    ));
    let manager = IndexManager::new(
        Arc::clone(&config),
        pool,
        search.clone() as Arc<dyn SearchClient>,
        documents,
    );

    Harness {
        config,
        sparql,
        search,
        extractor,
        manager,
        tempdir,
    }
}

pub fn scope_of(groups: &[&str]) -> AccessScope {
    AccessScope::new(
        groups
            .iter()
            .map(|g| trellis_auth::AccessGroup::new(*g))
            .collect::<Vec<_>>(),
    )
}
