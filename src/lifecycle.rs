//! Startup warming and clean shutdown.
//!
//! [`CacheService`] owns every registered cache together with its watcher.
//! [`start`](CacheService::start) loads all caches before any watcher is
//! started and fails if any first load fails, so a service never accepts
//! traffic against empty configuration. [`shutdown`](CacheService::shutdown)
//! stops all watchers concurrently with a bounded wait each.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, try_join_all};
use serde::Serialize;
use tracing::{error, info};

use crate::cache::ManagedCache;
use crate::health::{HealthReport, InstanceHealth};
use crate::store::ChangeFeed;
use crate::watcher::{BackoffConfig, Watcher};
use crate::{MimirError, Result};

/// Default per-watcher stop timeout.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

struct Entry {
    cache: Arc<dyn ManagedCache>,
    watcher: Watcher,
}

/// Outcome of [`CacheService::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    /// Watchers that had to be aborted after the timeout.
    pub timed_out: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty()
    }
}

/// Owns the {cache, watcher} pairs of one service.
pub struct CacheService {
    feed: Arc<dyn ChangeFeed>,
    backoff: BackoffConfig,
    shutdown_timeout: Duration,
    entries: Vec<Entry>,
}

impl CacheService {
    /// Create an empty service whose watchers follow `feed`.
    pub fn new(feed: Arc<dyn ChangeFeed>, backoff: BackoffConfig) -> Self {
        Self {
            feed,
            backoff,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            entries: Vec::new(),
        }
    }

    /// Set the per-watcher stop timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Add a cache and create its (stopped) watcher.
    pub fn register<C>(&mut self, cache: Arc<C>)
    where
        C: ManagedCache + 'static,
    {
        let watcher = Watcher::for_cache(&cache, Arc::clone(&self.feed), self.backoff.clone());
        self.entries.push(Entry { cache, watcher });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Watcher of the named cache.
    pub fn watcher(&self, name: &str) -> Option<&Watcher> {
        self.entries
            .iter()
            .find(|e| e.cache.name() == name)
            .map(|e| &e.watcher)
    }

    /// Warm every cache, then start every watcher.
    ///
    /// Caches load concurrently. The first failure aborts startup with
    /// [`MimirError::Startup`] and no watcher is started.
    pub async fn start(&self) -> Result<()> {
        let warming = self.entries.iter().map(|entry| {
            let cache = Arc::clone(&entry.cache);
            async move {
                let size = cache.reload_all().await.map_err(|e| {
                    error!(cache = cache.name(), error = %e, "cache failed to warm");
                    MimirError::Startup {
                        name: cache.name().to_string(),
                        source: Box::new(e),
                    }
                })?;
                info!(cache = cache.name(), size, "cache warmed");
                Ok::<_, MimirError>(())
            }
        });
        try_join_all(warming).await?;

        for entry in &self.entries {
            entry.watcher.start();
        }
        info!(caches = self.entries.len(), "cache service started");
        Ok(())
    }

    /// Stop every watcher, each bounded by the shutdown timeout.
    ///
    /// Never fails: watchers that do not stop in time are aborted and
    /// listed in the report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let timeout = self.shutdown_timeout;
        let results = join_all(self.entries.iter().map(|entry| async move {
            let outcome = entry.watcher.stop(timeout).await;
            (entry.watcher.name().to_string(), outcome)
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (name, outcome) in results {
            match outcome {
                Ok(()) => report.stopped.push(name),
                Err(_) => report.timed_out.push(name),
            }
        }
        if report.is_clean() {
            info!(stopped = report.stopped.len(), "cache service stopped");
        } else {
            error!(timed_out = ?report.timed_out, "cache service stopped with lingering watchers");
        }
        report
    }

    /// Non-blocking health of every cache and watcher.
    pub fn health(&self) -> HealthReport {
        HealthReport {
            caches: self
                .entries
                .iter()
                .map(|e| InstanceHealth::new(e.cache.name(), &e.cache.health(), &e.watcher.state()))
                .collect(),
        }
    }
}
