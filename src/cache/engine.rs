//! Generic read-through snapshot cache.
//!
//! [`CacheEngine`] serves reads from an immutable [`CacheSnapshot`] held in
//! an [`ArcSwapOption`]. A read takes a pointer-sized atomic load and then
//! works on the snapshot without any lock.
//!
//! # Validity
//!
//! A snapshot is valid while it is younger than the TTL *and* no
//! invalidation has happened since the reload that produced it started.
//! The second half is tracked with a generation counter: every invalidation
//! bumps it, and every snapshot remembers the generation it was loaded
//! under. A reload that races with an invalidation therefore produces a
//! snapshot that is already invalid, and the next read reloads again.
//!
//! # Reload deduplication
//!
//! Misses queue on a single async gate. Each caller notes how many reloads
//! had finished and which generation it saw before it queued. Once it holds
//! the gate, if that count moved, some other caller's reload ran while it
//! waited. The caller takes that outcome instead of querying the store again,
//! provided the reload started no earlier than the caller's generation (or
//! failed, in which case the fallback is all there is). A reload that began
//! before an invalidation the caller already saw is never reused. N
//! concurrent misses cost one store query.
//!
//! # Failure handling
//!
//! A failed reload never discards data. The last successfully loaded
//! snapshot is kept as a fallback and served (stale) until the store comes
//! back. Only when nothing was ever loaded does a read fail. For
//! [`reload_retry_interval`](CacheConfig::reload_retry_interval) after a
//! failure, misses serve the fallback without touching the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::invalidation::{Invalidate, InvalidationReason, InvalidationSignal, Subject};
use super::snapshot::CacheSnapshot;
use super::source::CacheSource;
use crate::store::{Document, DocumentStore};
use crate::telemetry::CacheMetrics;
use crate::{MimirError, Result};

/// Buffered invalidation signals per observer before it starts lagging.
const INVALIDATION_CHANNEL_CAPACITY: usize = 64;

/// Configuration for a cache engine.
///
/// ```rust
/// # use mimir::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .ttl(Duration::from_secs(120))
///     .reload_retry_interval(Duration::from_millis(500));
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum snapshot age before a read reloads. Safety net for a dead
    /// watcher; default: 5 minutes.
    pub ttl: Duration,
    /// How long after a failed reload misses serve the stale snapshot
    /// without querying the store again. Default: 1 second.
    pub reload_retry_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            reload_retry_interval: Duration::from_secs(1),
        }
    }
}

impl CacheConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the snapshot time-to-live.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the quiet period after a failed reload.
    pub fn reload_retry_interval(mut self, interval: Duration) -> Self {
        self.reload_retry_interval = interval;
        self
    }
}

/// Point-in-time view of a cache, read without blocking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHealth {
    /// Items in the current snapshot or, once it has been invalidated, in
    /// the last successfully loaded one. A non-zero size does not mean a
    /// snapshot is currently held; check `valid` for that.
    pub size: usize,
    /// Age of the same snapshot as `size`; `None` if nothing was ever
    /// loaded. Keeps growing through invalidations and outages, so it
    /// tracks how old the freshest data the cache has seen is.
    pub age_seconds: Option<f64>,
    /// Whether a read right now would be served without a reload.
    pub valid: bool,
    /// Whether any load has ever succeeded. Tells "never loaded" apart from
    /// "loaded and legitimately empty".
    pub loaded: bool,
}

/// Object-safe view of a cache used by lifecycle hooks and health reporting.
#[async_trait]
pub trait ManagedCache: Invalidate {
    fn name(&self) -> &str;

    /// Collection the watcher must follow.
    fn collection(&self) -> &str;

    /// Query the store and swap in a fresh snapshot. Failures propagate.
    async fn reload_all(&self) -> Result<usize>;

    fn health(&self) -> CacheHealth;
}

type Snapshot<S> = CacheSnapshot<<S as CacheSource>::Key, <S as CacheSource>::Value>;

/// Read-through snapshot cache for one configuration type.
pub struct CacheEngine<S: CacheSource> {
    source: S,
    store: Arc<dyn DocumentStore>,
    config: CacheConfig,
    metrics: CacheMetrics,
    /// Snapshot served to readers; `None` when never loaded or invalidated.
    current: ArcSwapOption<Snapshot<S>>,
    /// Last successful load, kept to serve while the store is unreachable.
    last_good: ArcSwapOption<Snapshot<S>>,
    generation: AtomicU64,
    reloads_finished: AtomicU64,
    reload_gate: tokio::sync::Mutex<()>,
    last_failure: Mutex<Option<Instant>>,
    invalidations: broadcast::Sender<InvalidationSignal>,
}

impl<S: CacheSource> CacheEngine<S> {
    /// Create an empty (never loaded) cache.
    pub fn new(source: S, store: Arc<dyn DocumentStore>, config: CacheConfig) -> Self {
        let metrics = CacheMetrics::new(source.name());
        let (invalidations, _) = broadcast::channel(INVALIDATION_CHANNEL_CAPACITY);
        Self {
            source,
            store,
            config,
            metrics,
            current: ArcSwapOption::empty(),
            last_good: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            reloads_finished: AtomicU64::new(0),
            reload_gate: tokio::sync::Mutex::new(()),
            last_failure: Mutex::new(None),
            invalidations,
        }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ===== Reads =====

    /// Look up one value, reloading first if the snapshot is absent or stale.
    ///
    /// Returns `Ok(None)` when the key is not in the collection.
    pub async fn get(&self, key: &S::Key) -> Result<Option<S::Value>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.get(key).cloned())
    }

    /// Copy of the whole collection, reloading first if needed.
    pub async fn get_all(&self) -> Result<HashMap<S::Key, S::Value>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.items().clone())
    }

    /// The snapshot a read would be served from, reloading first if needed.
    ///
    /// Fails only if no snapshot was ever loaded and the store is
    /// unreachable.
    pub async fn snapshot(&self) -> Result<Arc<Snapshot<S>>> {
        if let Some(snapshot) = self.valid_snapshot() {
            self.metrics.hit();
            self.record_gauges(&snapshot);
            return Ok(snapshot);
        }

        self.metrics.miss();
        let snapshot = self.load_on_miss().await?;
        self.record_gauges(&snapshot);
        Ok(snapshot)
    }

    /// Non-blocking view of the cache; never triggers a reload.
    pub fn health(&self) -> CacheHealth {
        let current = self.current.load_full();
        let valid = current.as_ref().is_some_and(|s| self.is_valid(s));
        let shown = current.or_else(|| self.last_good.load_full());
        CacheHealth {
            size: shown.as_ref().map_or(0, |s| s.len()),
            age_seconds: shown.as_ref().map(|s| s.age().as_secs_f64()),
            valid,
            loaded: shown.is_some(),
        }
    }

    /// Observe every invalidation this engine applies.
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationSignal> {
        self.invalidations.subscribe()
    }

    // ===== Reloads =====

    /// Query the store and swap in a fresh snapshot unconditionally.
    ///
    /// Unlike reads, failures propagate; the previous snapshot is kept.
    /// Returns the number of items loaded.
    pub async fn reload_all(&self) -> Result<usize> {
        let _gate = self.reload_gate.lock().await;
        let snapshot = self.reload_locked().await?;
        Ok(snapshot.len())
    }

    async fn load_on_miss(&self) -> Result<Arc<Snapshot<S>>> {
        let observed = self.reloads_finished.load(Ordering::Acquire);
        let entered_at = self.generation.load(Ordering::Acquire);
        let _gate = self.reload_gate.lock().await;

        if let Some(snapshot) = self.valid_snapshot() {
            return Ok(snapshot);
        }
        if self.reloads_finished.load(Ordering::Acquire) != observed {
            // Queued behind another reload: reuse its outcome unless it
            // predates an invalidation this caller already saw.
            if self.failure_slot().is_some() {
                return self.fallback_snapshot();
            }
            if let Some(snapshot) = self.last_good.load_full()
                && snapshot.generation() >= entered_at
            {
                return Ok(snapshot);
            }
        }
        if self.within_retry_interval() {
            return self.fallback_snapshot();
        }

        self.expire_if_stale();
        match self.reload_locked().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => match self.last_good.load_full() {
                Some(stale) => {
                    warn!(
                        cache = self.name(),
                        age_secs = stale.age().as_secs_f64(),
                        error = %e,
                        "serving stale snapshot"
                    );
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }

    /// Must be called with `reload_gate` held.
    async fn reload_locked(&self) -> Result<Arc<Snapshot<S>>> {
        let generation = self.generation.load(Ordering::Acquire);
        let filter = self.source.store_filter();
        let started = Instant::now();
        let result = self.store.find(self.source.collection(), &filter).await;

        let outcome = match result {
            Ok(documents) => {
                let snapshot = Arc::new(self.build_snapshot(&documents, generation));
                self.last_good.store(Some(Arc::clone(&snapshot)));
                if self.generation.load(Ordering::Acquire) == generation {
                    self.current.store(Some(Arc::clone(&snapshot)));
                } else {
                    debug!(
                        cache = self.name(),
                        "invalidated during reload, snapshot kept as fallback only"
                    );
                }
                *self.failure_slot() = None;
                self.metrics.reload(true);
                self.record_gauges(&snapshot);
                debug!(
                    cache = self.name(),
                    size = snapshot.len(),
                    documents = documents.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "snapshot reloaded"
                );
                Ok(snapshot)
            }
            Err(e) => {
                *self.failure_slot() = Some(Instant::now());
                self.metrics.reload(false);
                if self.last_good.load().is_some() {
                    warn!(cache = self.name(), error = %e, "reload failed");
                } else {
                    error!(cache = self.name(), error = %e, "initial load failed");
                }
                Err(e)
            }
        };
        self.reloads_finished.fetch_add(1, Ordering::Release);
        outcome
    }

    /// Parse every document, skipping (and logging) the malformed ones.
    /// Duplicate keys resolve last-write-wins.
    fn build_snapshot(&self, documents: &[Document], generation: u64) -> Snapshot<S> {
        let mut items = HashMap::with_capacity(documents.len());
        for document in documents {
            match self.source.parse(document) {
                Ok(value) => {
                    let key = self.source.extract_key(&value);
                    if items.insert(key.clone(), value).is_some() {
                        debug!(cache = self.name(), ?key, "duplicate key, keeping last");
                    }
                }
                Err(e) => {
                    self.metrics.parse_failure();
                    warn!(
                        cache = self.name(),
                        document_id = %document.id,
                        error = %e,
                        "skipping malformed document"
                    );
                }
            }
        }
        CacheSnapshot::new(items, generation)
    }

    // ===== Internals =====

    fn is_valid(&self, snapshot: &Snapshot<S>) -> bool {
        snapshot.generation() == self.generation.load(Ordering::Acquire)
            && snapshot.age() < self.config.ttl
    }

    fn valid_snapshot(&self) -> Option<Arc<Snapshot<S>>> {
        let snapshot = self.current.load_full()?;
        self.is_valid(&snapshot).then_some(snapshot)
    }

    fn fallback_snapshot(&self) -> Result<Arc<Snapshot<S>>> {
        self.last_good.load_full().ok_or_else(|| {
            MimirError::StoreUnavailable(format!("cache '{}' has never been loaded", self.name()))
        })
    }

    /// Turn a TTL lapse into an explicit invalidation so it is counted.
    fn expire_if_stale(&self) {
        let expired = self.current.load_full().is_some_and(|s| {
            s.generation() == self.generation.load(Ordering::Acquire) && s.age() >= self.config.ttl
        });
        if expired {
            self.invalidate(InvalidationSignal::new(
                InvalidationReason::TtlExpired,
                Subject::All,
            ));
        }
    }

    fn within_retry_interval(&self) -> bool {
        let last_failure = *self.failure_slot();
        last_failure.is_some_and(|at| at.elapsed() < self.config.reload_retry_interval)
    }

    fn failure_slot(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_gauges(&self, snapshot: &Snapshot<S>) {
        self.metrics
            .snapshot_gauges(snapshot.age().as_secs_f64(), snapshot.len());
    }
}

impl<S: CacheSource> Invalidate for CacheEngine<S> {
    /// Drop the current snapshot; the next read reloads.
    fn invalidate(&self, signal: InvalidationSignal) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.current.store(None);
        self.metrics.invalidation(signal.reason);
        debug!(
            cache = self.name(),
            reason = %signal.reason,
            subject = %signal.subject,
            "snapshot invalidated"
        );
        // No observers is fine.
        let _ = self.invalidations.send(signal);
    }
}

#[async_trait]
impl<S: CacheSource> ManagedCache for CacheEngine<S> {
    fn name(&self) -> &str {
        self.source.name()
    }

    fn collection(&self) -> &str {
        self.source.collection()
    }

    async fn reload_all(&self) -> Result<usize> {
        CacheEngine::reload_all(self).await
    }

    fn health(&self) -> CacheHealth {
        CacheEngine::health(self)
    }
}
