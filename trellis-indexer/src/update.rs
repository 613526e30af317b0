//! Keyed update coalescing.
//!
//! Delta processing produces `(subject, type)` work items faster than
//! documents can be rebuilt. The update handler keeps at most one task
//! in flight per key: a submission for a queued key is a no-op, a
//! submission for a running key marks it dirty so the task re-runs once
//! more with fresh state. Several deltas touching one resource thus
//! collapse into a single triplestore and backend round-trip.
//!
//! Per-key ordering is preserved by construction; distinct keys run in
//! parallel up to the configured worker count.

use crate::document::document_id;
use crate::error::IndexerError;
use crate::index::{IndexStatus, SearchIndex};
use crate::manager::IndexManager;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use trellis_config::IndexDefinition;

/// One unit of work: re-derive the document of `subject` for the
/// indexes of `type_name`.
pub type UpdateKey = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    /// Submitted, waiting for a worker.
    Queued,
    /// A worker is processing the key.
    Running,
    /// Re-submitted while running; one more pass is needed.
    Dirty,
}

/// Coalescing queue applying per-subject updates.
pub struct UpdateHandler {
    manager: Arc<IndexManager>,
    states: Mutex<HashMap<UpdateKey, KeyState>>,
    sender: Mutex<Option<mpsc::UnboundedSender<UpdateKey>>>,
    outstanding: AtomicUsize,
    idle: Notify,
    debounce: Duration,
    workers: Arc<Semaphore>,
}

impl UpdateHandler {
    /// Create the handler and start its dispatcher task.
    pub fn new(manager: Arc<IndexManager>) -> Arc<Self> {
        let workers = manager.config().settings.number_of_threads;
        let debounce = manager.config().settings.update_wait_interval;
        let (sender, receiver) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            workers: Arc::new(Semaphore::new(workers)),
            debounce,
            manager,
            states: Mutex::new(HashMap::new()),
            sender: Mutex::new(Some(sender)),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        tokio::spawn(Self::dispatch(Arc::clone(&handler), receiver));
        handler
    }

    /// Submit a work item. Coalesces with pending work for the same
    /// key.
    pub fn submit(&self, subject: impl Into<String>, type_name: impl Into<String>) {
        let key: UpdateKey = (subject.into(), type_name.into());
        let mut states = self.states.lock().expect("update state lock poisoned");
        match states.get(&key) {
            None => {
                states.insert(key.clone(), KeyState::Queued);
                drop(states);
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                let sender = self.sender.lock().expect("update sender lock poisoned");
                let delivered = sender
                    .as_ref()
                    .map(|tx| tx.send(key.clone()).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    tracing::warn!(
                        target: "update_handler",
                        subject = %key.0,
                        "update dropped, handler is shut down"
                    );
                    self.states
                        .lock()
                        .expect("update state lock poisoned")
                        .remove(&key);
                    self.finish_one();
                }
            }
            Some(KeyState::Running) => {
                states.insert(key, KeyState::Dirty);
            }
            Some(KeyState::Queued) | Some(KeyState::Dirty) => {}
        }
    }

    /// Number of keys queued or in flight.
    pub fn pending(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every submitted key has been processed.
    pub async fn drain(&self) {
        loop {
            if self.pending() == 0 {
                return;
            }
            // finish_one stores a wakeup permit, so a completion between
            // the check and the await is not lost.
            self.idle.notified().await;
        }
    }

    /// Stop accepting work and wait for in-flight tasks.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .expect("update sender lock poisoned")
            .take();
        self.drain().await;
    }

    async fn dispatch(handler: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<UpdateKey>) {
        while let Some(key) = receiver.recv().await {
            let permit = handler
                .workers
                .clone()
                .acquire_owned()
                .await
                .expect("update worker semaphore closed");
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let _permit = permit;
                handler.run_key(key).await;
            });
        }
    }

    async fn run_key(&self, key: UpdateKey) {
        if !self.debounce.is_zero() {
            tokio::time::sleep(self.debounce).await;
        }
        loop {
            self.states
                .lock()
                .expect("update state lock poisoned")
                .insert(key.clone(), KeyState::Running);

            self.apply(&key.0, &key.1).await;

            let mut states = self.states.lock().expect("update state lock poisoned");
            if states.get(&key).copied() == Some(KeyState::Dirty) {
                // Re-submitted while running; run once more.
                continue;
            }
            states.remove(&key);
            break;
        }
        self.finish_one();
    }

    fn finish_one(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_one();
    }

    /// Apply one key: for every index of the type, check whether the
    /// subject is still visible under the index's authorization, then
    /// upsert or delete its document.
    async fn apply(&self, subject: &str, type_name: &str) {
        let Some(definition) = self.manager.config().definition(type_name) else {
            return;
        };
        let type_filter = crate::builder::type_filter(definition);

        for index in self.manager.registry().find_for_type(type_name) {
            if index.status() == IndexStatus::Deleted {
                continue;
            }
            let _guard = index.lock_writes().await;
            // A parallel remove may have run while we waited.
            if index.status() == IndexStatus::Deleted {
                continue;
            }
            if let Err(e) = self
                .apply_to_index(subject, definition, &type_filter, &index)
                .await
            {
                tracing::warn!(
                    target: "update_handler",
                    subject,
                    index = index.name(),
                    error = %e,
                    "update failed"
                );
            }
        }
    }

    async fn apply_to_index(
        &self,
        subject: &str,
        definition: &IndexDefinition,
        type_filter: &str,
        index: &Arc<SearchIndex>,
    ) -> crate::error::Result<()> {
        let ask = format!("ASK {{ <{subject}> a ?type . FILTER(?type IN ({type_filter})) }}");
        let exists = self
            .manager
            .pool()
            .with_authorization(index.allowed_groups(), |client| async move {
                client.ask(&ask).await
            })
            .await?;

        if exists {
            let document = self
                .manager
                .pool()
                .with_authorization(index.allowed_groups(), |client| async move {
                    self.manager
                        .documents()
                        .build(client.as_ref(), subject, definition)
                        .await
                })
                .await?;
            let Some(id) = document_id(&document).map(str::to_string) else {
                return Err(IndexerError::MissingUuid(subject.to_string()));
            };
            tracing::debug!(target: "update_handler", subject, index = index.name(), "upserting document");
            if let Err(e) = self
                .manager
                .search()
                .upsert_document(index.name(), &id, &document)
                .await
            {
                index.mark_invalid();
                return Err(e.into());
            }
        } else {
            // Not visible (deleted, or authorization denies it): make
            // sure no document lingers in this index.
            self.delete_by_uri(subject, index).await?;
        }
        Ok(())
    }

    /// Remove the documents carrying this subject's uri, if any. The
    /// uuid is no longer resolvable once the resource is gone, so the
    /// lookup goes through the forced `uri` keyword field.
    async fn delete_by_uri(&self, subject: &str, index: &Arc<SearchIndex>) -> crate::error::Result<()> {
        let query = json!({
            "query": { "term": { "uri": subject } },
            "_source": false,
            "size": 100
        });
        let response = self.manager.search().search(index.name(), &query).await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                index.mark_invalid();
                return Err(e.into());
            }
        };
        let ids: Vec<String> = response
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| hit.get("_id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        for id in ids {
            tracing::debug!(target: "update_handler", subject, index = index.name(), id, "deleting document");
            if let Err(e) = self.manager.search().delete_document(index.name(), &id).await {
                index.mark_invalid();
                return Err(e.into());
            }
        }
        Ok(())
    }
}
