//! Tests for [`CacheEngine`] read, reload and invalidation behavior.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;

use mimir::{
    AgentConfigCache, AgentConfigs, CacheConfig, CacheEngine, Document, DocumentStore, Filter,
    Invalidate, InvalidationReason, InvalidationSignal, MemoryStore, MimirError, Result, Subject,
};

const AGENTS: &str = "agent_configs";

// ============================================================================
// Helpers
// ============================================================================

fn agent(agent_type: &str, model: &str) -> serde_json::Value {
    json!({"agent_type": agent_type, "model": model, "status": "active"})
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert(AGENTS, "A", agent("summarizer", "small"));
    store.insert(AGENTS, "B", agent("classifier", "large"));
    store
}

fn cache_with(store: &Arc<MemoryStore>, config: CacheConfig) -> Arc<AgentConfigCache> {
    Arc::new(CacheEngine::new(AgentConfigs::default(), store.clone(), config))
}

/// Store whose query reads the documents first and only returns them after
/// a pause, so writes made during the pause are missing from the result.
struct SlowReturnStore {
    inner: Arc<MemoryStore>,
    pause: Duration,
}

#[async_trait]
impl DocumentStore for SlowReturnStore {
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        let documents = self.inner.find(collection, filter).await?;
        tokio::time::sleep(self.pause).await;
        Ok(documents)
    }
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn first_read_loads_and_second_is_served_from_memory() {
    let store = seeded_store();
    let cache = cache_with(&store, CacheConfig::default());

    let all = cache.get_all().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(store.find_calls(), 1);

    let a = cache.get(&"A".to_string()).await.unwrap().unwrap();
    assert_eq!(a.model, "small");
    assert_eq!(store.find_calls(), 1);
}

#[tokio::test]
async fn unknown_key_is_none() {
    let store = seeded_store();
    let cache = cache_with(&store, CacheConfig::default());
    assert!(cache.get(&"Z".to_string()).await.unwrap().is_none());
}

#[tokio::test]
async fn inactive_documents_are_not_cached() {
    let store = seeded_store();
    store.insert(
        AGENTS,
        "C",
        json!({"agent_type": "writer", "model": "m", "status": "disabled"}),
    );
    let cache = cache_with(&store, CacheConfig::default());

    let all = cache.get_all().await.unwrap();
    assert!(!all.contains_key("C"));
    assert_eq!(all.len(), 2);
}

// ============================================================================
// Deduplication and invalidation
// ============================================================================

#[tokio::test]
async fn concurrent_misses_issue_one_query() {
    let store = seeded_store();
    let cache = cache_with(&store, CacheConfig::default());
    cache.reload_all().await.unwrap();
    cache.invalidate(InvalidationSignal::manual());

    store.set_latency(Duration::from_millis(50));
    let before = store.find_calls();
    let reads = (0..16).map(|_| {
        let cache = Arc::clone(&cache);
        async move { cache.get_all().await }
    });
    let results = join_all(reads).await;

    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|m| m.len() == 2)));
    assert_eq!(store.find_calls() - before, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_across_threads_issue_one_query() {
    let store = seeded_store();
    let cache = cache_with(&store, CacheConfig::default());
    store.set_latency(Duration::from_millis(100));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_all().await.map(|m| m.len()) })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 2);
    }
    assert_eq!(store.find_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn read_queued_after_invalidation_does_not_reuse_older_reload() {
    let store = seeded_store();
    let slow = Arc::new(SlowReturnStore {
        inner: store.clone(),
        pause: Duration::from_millis(100),
    });
    let cache: Arc<AgentConfigCache> = Arc::new(CacheEngine::new(
        AgentConfigs::default(),
        slow,
        CacheConfig::default(),
    ));

    // First reader has read the old documents and is still in flight.
    let first = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move { cache.get_all().await }
    });
    while store.find_calls() == 0 {
        tokio::task::yield_now().await;
    }

    store.update(AGENTS, "A", json!({"model": "large"}));
    cache.invalidate(InvalidationSignal::new(
        InvalidationReason::ChangeFeedUpdate,
        Subject::Key("A".to_string()),
    ));

    // Queues behind the first reload, which finishes after the invalidation.
    let a = cache.get(&"A".to_string()).await.unwrap().unwrap();
    assert_eq!(a.model, "large");
    assert_eq!(store.find_calls(), 2);

    // The in-flight read may see the old data; it started before the write.
    assert!(first.await.unwrap().is_ok());
}

#[tokio::test]
async fn waiters_behind_a_failed_reload_share_its_outcome() {
    let store = seeded_store();
    let cache = cache_with(&store, CacheConfig::default());
    cache.get_all().await.unwrap();

    store.set_available(false);
    store.set_latency(Duration::from_millis(50));
    cache.invalidate(InvalidationSignal::manual());
    let before = store.find_calls();
    let reads = (0..8).map(|_| {
        let cache = Arc::clone(&cache);
        async move { cache.get_all().await }
    });
    let results = join_all(reads).await;

    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|m| m.len() == 2)));
    assert_eq!(store.find_calls() - before, 1);
}

#[tokio::test]
async fn repeated_invalidation_costs_one_reload() {
    let store = seeded_store();
    let cache = cache_with(&store, CacheConfig::default());
    cache.get_all().await.unwrap();

    for _ in 0..5 {
        cache.invalidate(InvalidationSignal::manual());
    }
    cache.get_all().await.unwrap();
    cache.get_all().await.unwrap();
    assert_eq!(store.find_calls(), 2);
}

#[tokio::test]
async fn invalidation_is_lazy() {
    let store = seeded_store();
    let cache = cache_with(&store, CacheConfig::default());
    cache.get_all().await.unwrap();

    cache.invalidate(InvalidationSignal::manual());
    assert_eq!(store.find_calls(), 1);
    assert!(!cache.health().valid);
}

#[tokio::test]
async fn invalidation_is_broadcast_to_observers() {
    let store = seeded_store();
    let cache = cache_with(&store, CacheConfig::default());
    let mut rx = cache.subscribe();

    cache.invalidate(InvalidationSignal::new(
        InvalidationReason::ChangeFeedDelete,
        Subject::Key("B".to_string()),
    ));
    let signal = rx.recv().await.unwrap();
    assert_eq!(signal.reason, InvalidationReason::ChangeFeedDelete);
    assert_eq!(signal.subject, Subject::Key("B".to_string()));
}

// ============================================================================
// TTL
// ============================================================================

#[tokio::test(start_paused = true)]
async fn ttl_expiry_triggers_exactly_one_reload() {
    let store = seeded_store();
    let cache = cache_with(&store, CacheConfig::new().ttl(Duration::from_secs(60)));
    let mut rx = cache.subscribe();
    cache.get_all().await.unwrap();

    tokio::time::advance(Duration::from_secs(59)).await;
    cache.get_all().await.unwrap();
    assert_eq!(store.find_calls(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(!cache.health().valid);
    cache.get_all().await.unwrap();
    cache.get_all().await.unwrap();
    assert_eq!(store.find_calls(), 2);

    let signal = rx.try_recv().unwrap();
    assert_eq!(signal.reason, InvalidationReason::TtlExpired);
    assert_eq!(signal.subject, Subject::All);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn malformed_document_is_skipped() {
    let store = seeded_store();
    store.insert(AGENTS, "broken", json!({"agent_type": "x", "status": "active"}));
    let cache = cache_with(&store, CacheConfig::default());

    assert_eq!(cache.reload_all().await.unwrap(), 2);
    let all = cache.get_all().await.unwrap();
    assert!(all.contains_key("A"));
    assert!(all.contains_key("B"));
    assert!(!all.contains_key("broken"));
}

#[tokio::test]
async fn first_load_failure_propagates() {
    let store = seeded_store();
    store.set_available(false);
    let cache = cache_with(&store, CacheConfig::default());

    let err = cache.get_all().await.unwrap_err();
    assert!(matches!(err, MimirError::StoreUnavailable(_)));
    assert!(cache.reload_all().await.is_err());
    assert!(!cache.health().loaded);
}

#[tokio::test]
async fn outage_serves_last_good_snapshot() {
    let store = seeded_store();
    let cache = cache_with(&store, CacheConfig::default());
    cache.get_all().await.unwrap();

    store.set_available(false);
    store.update(AGENTS, "A", json!({"model": "changed"}));
    cache.invalidate(InvalidationSignal::manual());

    let a = cache.get(&"A".to_string()).await.unwrap().unwrap();
    assert_eq!(a.model, "small");

    let health = cache.health();
    assert!(!health.valid);
    assert!(health.loaded);
    assert_eq!(health.size, 2);

    // Proactive refresh still reports the failure.
    assert!(cache.reload_all().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn failed_reload_is_not_retried_within_retry_interval() {
    let store = seeded_store();
    let config = CacheConfig::new().reload_retry_interval(Duration::from_secs(5));
    let cache = cache_with(&store, config);
    cache.get_all().await.unwrap();

    store.set_available(false);
    cache.invalidate(InvalidationSignal::manual());
    cache.get_all().await.unwrap();
    assert_eq!(store.find_calls(), 2);

    cache.get_all().await.unwrap();
    cache.get_all().await.unwrap();
    assert_eq!(store.find_calls(), 2);

    store.set_available(true);
    tokio::time::advance(Duration::from_secs(6)).await;
    cache.get_all().await.unwrap();
    assert_eq!(store.find_calls(), 3);
    assert!(cache.health().valid);
}

#[tokio::test]
async fn recovery_picks_up_changes_made_during_outage() {
    let store = seeded_store();
    let cache = cache_with(&store, CacheConfig::new().reload_retry_interval(Duration::ZERO));
    cache.get_all().await.unwrap();

    store.set_available(false);
    store.delete(AGENTS, "B");
    cache.invalidate(InvalidationSignal::manual());
    assert_eq!(cache.get_all().await.unwrap().len(), 2);

    store.set_available(true);
    let all = cache.get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all.contains_key("A"));
}
