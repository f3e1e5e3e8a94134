//! Change-feed watcher.
//!
//! A [`Watcher`] owns one long-lived subscription to the store's change feed
//! for one collection and turns every change record into an
//! [`InvalidationSignal`] for its cache. It runs as a background task:
//!
//! ```text
//! Stopped -> Starting -> Subscribed --(stream error)--> Backoff -> Starting -> ...
//!    ^__________________________ stop() from any state _______________|
//! ```
//!
//! The retry loop never gives up. Backoff sleeps and the wait for the next
//! record both race against cancellation, so [`Watcher::stop`] returns
//! promptly.
//!
//! The watcher's [`WatcherState`] is written only by its own task and
//! published through a `tokio::sync::watch` channel for health reporting.

pub mod backoff;

pub use backoff::BackoffConfig;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::{Invalidate, InvalidationReason, InvalidationSignal, ManagedCache, Subject};
use crate::store::{ChangeFeed, ChangeRecord, ChangeStream, OperationKind, ResumeToken};
use crate::telemetry::CacheMetrics;
use crate::{MimirError, Result};

/// Lifecycle phase of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherStatus {
    Stopped,
    Starting,
    Subscribed,
    Backoff,
}

/// Watcher bookkeeping, as last published by the watcher task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatcherState {
    pub status: WatcherStatus,
    pub subscription_active: bool,
    /// Position after the last processed record.
    pub last_resume_position: Option<ResumeToken>,
    /// Failures since the last subscription that delivered a record or
    /// stayed up for [`BackoffConfig::stable_after`].
    pub consecutive_failures: u32,
}

impl Default for WatcherState {
    fn default() -> Self {
        Self {
            status: WatcherStatus::Stopped,
            subscription_active: false,
            last_resume_position: None,
            consecutive_failures: 0,
        }
    }
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps one cache coherent with its collection's change feed.
pub struct Watcher {
    name: String,
    collection: String,
    feed: Arc<dyn ChangeFeed>,
    target: Arc<dyn Invalidate>,
    backoff: BackoffConfig,
    metrics: CacheMetrics,
    state: Arc<watch::Sender<WatcherState>>,
    task: Mutex<Option<RunningTask>>,
}

impl Watcher {
    /// Create a stopped watcher that will invalidate `target` on changes to
    /// `collection`.
    pub fn new(
        name: impl Into<String>,
        collection: impl Into<String>,
        feed: Arc<dyn ChangeFeed>,
        target: Arc<dyn Invalidate>,
        backoff: BackoffConfig,
    ) -> Self {
        let name = name.into();
        let (state, _) = watch::channel(WatcherState::default());
        Self {
            metrics: CacheMetrics::new(name.clone()),
            name,
            collection: collection.into(),
            feed,
            target,
            backoff,
            state: Arc::new(state),
            task: Mutex::new(None),
        }
    }

    /// Create a watcher for `cache`, following the cache's own collection.
    pub fn for_cache<C>(cache: &Arc<C>, feed: Arc<dyn ChangeFeed>, backoff: BackoffConfig) -> Self
    where
        C: ManagedCache + 'static,
    {
        let target: Arc<dyn Invalidate> = cache.clone();
        Self::new(cache.name(), cache.collection(), feed, target, backoff)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest published state.
    pub fn state(&self) -> WatcherState {
        self.state.borrow().clone()
    }

    /// Follow state changes (e.g. to wait for [`WatcherStatus::Subscribed`]).
    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Whether a background task is currently alive.
    pub fn is_running(&self) -> bool {
        self.task_slot()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Spawn the subscription loop. No-op if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut slot = self.task_slot();
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            debug!(watcher = %self.name, "already running");
            return;
        }

        self.state.send_modify(|s| s.status = WatcherStatus::Starting);
        let cancel = CancellationToken::new();
        let watch_loop = WatchLoop {
            name: self.name.clone(),
            collection: self.collection.clone(),
            feed: Arc::clone(&self.feed),
            target: Arc::clone(&self.target),
            backoff: self.backoff.clone(),
            metrics: self.metrics.clone(),
            state: Arc::clone(&self.state),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(watch_loop.run());
        *slot = Some(RunningTask { cancel, handle });
    }

    /// Cancel the background task and wait up to `timeout` for it to exit.
    ///
    /// On timeout the task is aborted, the watcher is marked stopped and
    /// [`MimirError::ShutdownTimeout`] is returned.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let Some(mut task) = self.task_slot().take() else {
            return Ok(());
        };
        task.cancel.cancel();

        match tokio::time::timeout(timeout, &mut task.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(watcher = %self.name, error = %e, "watcher task ended abnormally");
                self.mark_stopped();
                Ok(())
            }
            Err(_) => {
                task.handle.abort();
                self.mark_stopped();
                error!(watcher = %self.name, ?timeout, "watcher did not stop in time");
                Err(MimirError::ShutdownTimeout {
                    name: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    fn mark_stopped(&self) {
        self.state.send_modify(|s| {
            s.status = WatcherStatus::Stopped;
            s.subscription_active = false;
        });
        self.metrics.subscription_active(false);
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<RunningTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let slot = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            task.cancel.cancel();
        }
    }
}

/// State owned by the background task.
struct WatchLoop {
    name: String,
    collection: String,
    feed: Arc<dyn ChangeFeed>,
    target: Arc<dyn Invalidate>,
    backoff: BackoffConfig,
    metrics: CacheMetrics,
    state: Arc<watch::Sender<WatcherState>>,
    cancel: CancellationToken,
}

impl WatchLoop {
    async fn run(self) {
        let mut reconnecting = false;
        loop {
            self.state.send_modify(|s| s.status = WatcherStatus::Starting);
            let resume_from = self.state.borrow().last_resume_position.clone();
            let resuming = resume_from.is_some();

            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.feed.subscribe(&self.collection, &OperationKind::ALL, resume_from) => result,
            };

            let failure = match subscribed {
                Ok(stream) => {
                    self.on_subscribed(reconnecting, resuming);
                    match self.consume(stream).await {
                        Some(e) => e,
                        None => break,
                    }
                }
                Err(e) => {
                    if resuming {
                        // The position may be what the store rejects; start
                        // fresh next time and rely on the reconnect
                        // invalidation to cover the gap.
                        self.state.send_modify(|s| s.last_resume_position = None);
                    }
                    e
                }
            };

            reconnecting = true;
            let delay = self.enter_backoff(&failure);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_modify(|s| {
            s.status = WatcherStatus::Stopped;
            s.subscription_active = false;
        });
        self.metrics.subscription_active(false);
        info!(watcher = %self.name, "watcher stopped");
    }

    /// Side effects land before the new state is published, so anyone
    /// waiting on the state sees them.
    fn on_subscribed(&self, reconnecting: bool, resumed: bool) {
        self.metrics.subscription_active(true);
        if reconnecting {
            self.target.invalidate(InvalidationSignal::new(
                InvalidationReason::Reconnected,
                Subject::All,
            ));
        }
        self.state.send_modify(|s| {
            s.status = WatcherStatus::Subscribed;
            s.subscription_active = true;
        });
        info!(
            watcher = %self.name,
            collection = %self.collection,
            resumed,
            "change feed subscribed"
        );
    }

    /// Drain the stream until it fails (returns the error) or the watcher is
    /// cancelled (returns `None`).
    ///
    /// The failure count survives a successful subscribe and is only cleared
    /// once the subscription proves itself: a record arrives, or it stays up
    /// for `stable_after`. A feed that accepts and then drops at once keeps
    /// backing off further.
    async fn consume(&self, mut stream: ChangeStream) -> Option<MimirError> {
        let stable = tokio::time::sleep(self.backoff.stable_after);
        tokio::pin!(stable);
        let mut settled = false;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = &mut stable, if !settled => {
                    settled = true;
                    self.reset_failures();
                    continue;
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(record)) => {
                    if !settled {
                        settled = true;
                        self.reset_failures();
                    }
                    self.apply(record);
                }
                Some(Err(e)) => return Some(e),
                None => {
                    return Some(MimirError::ChangeFeedDisconnected(
                        "stream closed".to_string(),
                    ));
                }
            }
        }
    }

    fn reset_failures(&self) {
        self.state.send_if_modified(|s| {
            let had_failures = s.consecutive_failures > 0;
            s.consecutive_failures = 0;
            had_failures
        });
    }

    fn apply(&self, record: ChangeRecord) {
        debug!(
            watcher = %self.name,
            operation = record.operation.as_str(),
            key = %record.document_key,
            "change received"
        );
        self.target.invalidate(InvalidationSignal::from_change(
            record.operation,
            record.document_key,
        ));
        self.state
            .send_modify(|s| s.last_resume_position = Some(record.resume_token));
    }

    fn enter_backoff(&self, failure: &MimirError) -> Duration {
        let failures = self.state.borrow().consecutive_failures.saturating_add(1);
        self.metrics.subscription_active(false);
        self.metrics.reconnect();
        self.state.send_modify(|s| {
            s.status = WatcherStatus::Backoff;
            s.subscription_active = false;
            s.consecutive_failures = failures;
        });

        let delay = self.backoff.effective_delay(failures - 1);
        error!(
            watcher = %self.name,
            collection = %self.collection,
            error = %failure,
            consecutive_failures = failures,
            delay_ms = delay.as_millis() as u64,
            "change feed lost, backing off"
        );
        delay
    }
}
