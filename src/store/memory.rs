//! In-memory document store with a native change feed.
//!
//! [`MemoryStore`] implements both [`DocumentStore`] and [`ChangeFeed`].
//! Every mutation appends a [`ChangeRecord`] to a bounded history and
//! broadcasts it to live subscribers; resume tokens are the record's
//! sequence number, so a subscriber can replay what it missed as long as the
//! history still holds it.
//!
//! It also carries the knobs needed to exercise failure handling: query and
//! change-feed outages, forced disconnects, injected query latency, and call
//! counters.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::document::merge_fields;
use super::{
    ChangeFeed, ChangeRecord, ChangeStream, Document, DocumentStore, Filter, OperationKind,
    ResumeToken,
};
use crate::{MimirError, Result};

/// Default number of change records retained for resumption.
pub const DEFAULT_HISTORY_LIMIT: usize = 1_024;

/// Capacity of the live broadcast channel. Subscribers that fall further
/// behind than this are disconnected and must resume.
const FEED_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum FeedEvent {
    Change {
        collection: String,
        record: ChangeRecord,
    },
    Disconnect,
}

#[derive(Debug, Default)]
struct State {
    collections: HashMap<String, BTreeMap<String, Value>>,
    history: VecDeque<(u64, String, ChangeRecord)>,
    next_seq: u64,
}

/// Thread-safe in-memory document store.
pub struct MemoryStore {
    state: RwLock<State>,
    events: broadcast::Sender<FeedEvent>,
    history_limit: usize,
    available: AtomicBool,
    feed_available: AtomicBool,
    latency_ms: AtomicU64,
    find_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store with the default history limit.
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create an empty store retaining at most `limit` change records.
    pub fn with_history_limit(limit: usize) -> Self {
        let (events, _) = broadcast::channel(FEED_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(State {
                next_seq: 1,
                ..State::default()
            }),
            events,
            history_limit: limit.max(1),
            available: AtomicBool::new(true),
            feed_available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            find_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
        }
    }

    // ===== Mutations =====

    /// Insert (or overwrite) a document and emit an `insert` record.
    ///
    /// An `id` field is added to object bodies that lack one.
    pub fn insert(&self, collection: &str, id: &str, mut body: Value) {
        if let Value::Object(fields) = &mut body {
            fields
                .entry("id")
                .or_insert_with(|| Value::String(id.to_string()));
        }
        let mut state = self.write();
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), body.clone());
        self.emit(&mut state, collection, OperationKind::Insert, id, Some(body));
    }

    /// Merge `patch` into an existing document and emit an `update` record.
    ///
    /// Returns `false` (and emits nothing) if the document does not exist.
    pub fn update(&self, collection: &str, id: &str, patch: Value) -> bool {
        let mut state = self.write();
        let Some(doc) = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
        else {
            return false;
        };
        merge_fields(doc, patch);
        let post_image = doc.clone();
        self.emit(
            &mut state,
            collection,
            OperationKind::Update,
            id,
            Some(post_image),
        );
        true
    }

    /// Replace an existing document wholesale and emit a `replace` record.
    ///
    /// Returns `false` (and emits nothing) if the document does not exist.
    pub fn replace(&self, collection: &str, id: &str, body: Value) -> bool {
        let mut state = self.write();
        let Some(doc) = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
        else {
            return false;
        };
        *doc = body.clone();
        self.emit(&mut state, collection, OperationKind::Replace, id, Some(body));
        true
    }

    /// Remove a document and emit a `delete` record.
    ///
    /// Returns `false` (and emits nothing) if the document does not exist.
    pub fn delete(&self, collection: &str, id: &str) -> bool {
        let mut state = self.write();
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
            .is_some();
        if removed {
            self.emit(&mut state, collection, OperationKind::Delete, id, None);
        }
        removed
    }

    // ===== Inspection =====

    /// Current body of a document.
    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.read()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Number of documents in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        self.read()
            .collections
            .get(collection)
            .map_or(0, |docs| docs.len())
    }

    /// Whether `collection` holds no documents.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Number of `find` calls received, including failed ones.
    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    /// Number of `subscribe` calls received, including failed ones.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    // ===== Fault injection =====

    /// Make `find` fail with `StoreUnavailable` while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make `subscribe` fail with `ChangeFeedDisconnected` while `false`.
    pub fn set_change_feed_available(&self, available: bool) {
        self.feed_available.store(available, Ordering::SeqCst);
    }

    /// Delay every `find` by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Terminate every live subscription with a `ChangeFeedDisconnected` error.
    pub fn disconnect_feeds(&self) {
        let _ = self.events.send(FeedEvent::Disconnect);
    }

    // ===== Internals =====

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record and broadcast a change. Called with the write lock held so
    /// history order, broadcast order and commit order agree.
    fn emit(
        &self,
        state: &mut State,
        collection: &str,
        operation: OperationKind,
        id: &str,
        full_document: Option<Value>,
    ) {
        let seq = state.next_seq;
        state.next_seq += 1;
        let record = ChangeRecord {
            operation,
            document_key: id.to_string(),
            full_document,
            resume_token: ResumeToken::new(seq.to_string()),
        };
        state
            .history
            .push_back((seq, collection.to_string(), record.clone()));
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(FeedEvent::Change {
            collection: collection.to_string(),
            record,
        });
    }

    /// Records after `token` for `collection`, or an error if the token is
    /// unknown or already trimmed from history.
    fn backlog_after(
        &self,
        state: &State,
        collection: &str,
        operations: &[OperationKind],
        token: &ResumeToken,
    ) -> Result<VecDeque<ChangeRecord>> {
        let after: u64 = token.as_str().parse().map_err(|_| {
            MimirError::ChangeFeedDisconnected(format!("malformed resume token '{}'", token.as_str()))
        })?;
        let oldest = state
            .history
            .front()
            .map_or(state.next_seq, |(seq, _, _)| *seq);
        if after >= state.next_seq || after + 1 < oldest {
            return Err(MimirError::ChangeFeedDisconnected(format!(
                "resume token '{}' is no longer available",
                token.as_str()
            )));
        }
        Ok(state
            .history
            .iter()
            .filter(|(seq, coll, record)| {
                *seq > after && coll == collection && operations.contains(&record.operation)
            })
            .map(|(_, _, record)| record.clone())
            .collect())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(MimirError::StoreUnavailable(format!(
                "collection '{collection}' is unreachable"
            )));
        }
        let state = self.read();
        let docs = state
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, body)| filter.matches(body))
                    .map(|(id, body)| Document::new(id.clone(), body.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(docs)
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe(
        &self,
        collection: &str,
        operations: &[OperationKind],
        resume_from: Option<ResumeToken>,
    ) -> Result<ChangeStream> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if !self.feed_available.load(Ordering::SeqCst) {
            return Err(MimirError::ChangeFeedDisconnected(format!(
                "change feed for '{collection}' is unreachable"
            )));
        }

        // Subscribe under the lock so no record lands between the backlog
        // and the live receiver.
        let state = self.read();
        let backlog = match &resume_from {
            Some(token) => self.backlog_after(&state, collection, operations, token)?,
            None => VecDeque::new(),
        };
        let receiver = self.events.subscribe();
        drop(state);

        let cursor = FeedCursor {
            backlog,
            receiver,
            collection: collection.to_string(),
            operations: operations.to_vec(),
            finished: false,
        };
        Ok(Box::pin(futures_util::stream::unfold(
            cursor,
            |mut cursor| async move { cursor.next().await.map(|item| (item, cursor)) },
        )))
    }
}

/// Per-subscription read position: replayed backlog first, then live events.
struct FeedCursor {
    backlog: VecDeque<ChangeRecord>,
    receiver: broadcast::Receiver<FeedEvent>,
    collection: String,
    operations: Vec<OperationKind>,
    finished: bool,
}

impl FeedCursor {
    async fn next(&mut self) -> Option<Result<ChangeRecord>> {
        if self.finished {
            return None;
        }
        if let Some(record) = self.backlog.pop_front() {
            return Some(Ok(record));
        }
        loop {
            match self.receiver.recv().await {
                Ok(FeedEvent::Change { collection, record })
                    if collection == self.collection
                        && self.operations.contains(&record.operation) =>
                {
                    return Some(Ok(record));
                }
                Ok(FeedEvent::Change { .. }) => continue,
                Ok(FeedEvent::Disconnect) => {
                    self.finished = true;
                    return Some(Err(MimirError::ChangeFeedDisconnected(
                        "subscription dropped by store".to_string(),
                    )));
                }
                Err(RecvError::Lagged(skipped)) => {
                    self.finished = true;
                    return Some(Err(MimirError::ChangeFeedDisconnected(format!(
                        "subscriber lagged behind by {skipped} records"
                    ))));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn find_applies_filter() {
        let store = MemoryStore::new();
        store.insert("sources", "a", json!({"status": "active"}));
        store.insert("sources", "b", json!({"status": "paused"}));

        let docs = store
            .find("sources", &Filter::all().eq("status", "active"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "a");
        assert_eq!(docs[0].body["id"], "a");
        assert_eq!(store.find_calls(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_find() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.find("sources", &Filter::all()).await.unwrap_err();
        assert!(matches!(err, MimirError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn live_subscription_sees_matching_collection_only() {
        let store = MemoryStore::new();
        let mut feed = store
            .subscribe("agents", &OperationKind::ALL, None)
            .await
            .unwrap();

        store.insert("prompts", "p", json!({}));
        store.insert("agents", "A", json!({"model": "small"}));

        let record = feed.next().await.unwrap().unwrap();
        assert_eq!(record.operation, OperationKind::Insert);
        assert_eq!(record.document_key, "A");
    }

    #[tokio::test]
    async fn update_of_missing_document_emits_nothing() {
        let store = MemoryStore::new();
        assert!(!store.update("agents", "ghost", json!({"x": 1})));
        assert!(!store.delete("agents", "ghost"));
        assert!(store.is_empty("agents"));
    }

    #[tokio::test]
    async fn resume_replays_missed_records() {
        let store = MemoryStore::new();
        store.insert("agents", "A", json!({}));
        store.insert("agents", "B", json!({}));
        store.update("agents", "A", json!({"model": "large"}));

        // Token of the first insert: expect the second insert and the update.
        let mut feed = store
            .subscribe("agents", &OperationKind::ALL, Some(ResumeToken::new("1")))
            .await
            .unwrap();
        let first = feed.next().await.unwrap().unwrap();
        let second = feed.next().await.unwrap().unwrap();
        assert_eq!(first.document_key, "B");
        assert_eq!(second.operation, OperationKind::Update);
        assert_eq!(second.full_document.unwrap()["model"], "large");
    }

    #[tokio::test]
    async fn trimmed_resume_token_is_rejected() {
        let store = MemoryStore::with_history_limit(2);
        for id in ["a", "b", "c", "d"] {
            store.insert("agents", id, json!({}));
        }
        let result = store
            .subscribe("agents", &OperationKind::ALL, Some(ResumeToken::new("1")))
            .await;
        assert!(matches!(result, Err(MimirError::ChangeFeedDisconnected(_))));
    }

    #[tokio::test]
    async fn disconnect_ends_stream_with_error() {
        let store = MemoryStore::new();
        let mut feed = store
            .subscribe("agents", &OperationKind::ALL, None)
            .await
            .unwrap();
        store.disconnect_feeds();

        let item = feed.next().await.unwrap();
        assert!(matches!(item, Err(MimirError::ChangeFeedDisconnected(_))));
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn operations_filter_is_respected() {
        let store = MemoryStore::new();
        let mut feed = store
            .subscribe("agents", &[OperationKind::Delete], None)
            .await
            .unwrap();
        store.insert("agents", "A", json!({}));
        store.delete("agents", "A");

        let record = feed.next().await.unwrap().unwrap();
        assert_eq!(record.operation, OperationKind::Delete);
        assert!(record.full_document.is_none());
    }
}
