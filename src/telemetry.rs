//! Telemetry metric name constants and the per-instance recorder.
//!
//! Consumers install their own `metrics` recorder (e.g. prometheus, statsd);
//! without a recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! Counters end in `_total`, gauges carry their unit (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `instance`: cache instance name (e.g. "agent_configs")
//! - `reason`: invalidation reason (e.g. "change_feed_update", "ttl_expired")
//! - `status`: reload outcome: "ok" or "error"

use crate::cache::InvalidationReason;

/// Reads served from a valid snapshot.
///
/// Labels: `instance`.
pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";

/// Reads that found the snapshot absent or stale.
///
/// Labels: `instance`.
pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";

/// Snapshot invalidations.
///
/// Labels: `instance`, `reason`.
pub const CACHE_INVALIDATIONS_TOTAL: &str = "cache_invalidations_total";

/// Age of the snapshot served by the most recent read or reload.
///
/// Labels: `instance`.
pub const CACHE_AGE_SECONDS: &str = "cache_age_seconds";

/// Number of items in the most recently served snapshot.
///
/// Labels: `instance`.
pub const CACHE_SIZE: &str = "cache_size";

/// Store queries issued by reloads.
///
/// Labels: `instance`, `status` ("ok" | "error").
pub const CACHE_RELOADS_TOTAL: &str = "cache_reloads_total";

/// Documents skipped during a reload because they failed to parse.
///
/// Labels: `instance`.
pub const CACHE_PARSE_FAILURES_TOTAL: &str = "cache_parse_failures_total";

/// Change-feed subscription failures that sent the watcher into backoff.
///
/// Labels: `instance`.
pub const CHANGE_FEED_RECONNECTS_TOTAL: &str = "change_feed_reconnects_total";

/// 1 while the watcher holds a live subscription, 0 otherwise.
///
/// Labels: `instance`.
pub const CHANGE_FEED_SUBSCRIPTION_ACTIVE: &str = "change_feed_subscription_active";

/// Records metrics for one cache instance.
///
/// Cheap to clone; the engine and its watcher each hold a copy so every
/// series for a configuration type carries the same `instance` label.
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    instance: String,
}

impl CacheMetrics {
    /// Create a recorder labelled with `instance`.
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// The `instance` label value.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn hit(&self) {
        metrics::counter!(CACHE_HITS_TOTAL, "instance" => self.instance.clone()).increment(1);
    }

    pub fn miss(&self) {
        metrics::counter!(CACHE_MISSES_TOTAL, "instance" => self.instance.clone()).increment(1);
    }

    pub fn invalidation(&self, reason: InvalidationReason) {
        metrics::counter!(CACHE_INVALIDATIONS_TOTAL,
            "instance" => self.instance.clone(),
            "reason" => reason.as_str(),
        )
        .increment(1);
    }

    pub fn reload(&self, ok: bool) {
        let status = if ok { "ok" } else { "error" };
        metrics::counter!(CACHE_RELOADS_TOTAL,
            "instance" => self.instance.clone(),
            "status" => status,
        )
        .increment(1);
    }

    pub fn parse_failure(&self) {
        metrics::counter!(CACHE_PARSE_FAILURES_TOTAL, "instance" => self.instance.clone())
            .increment(1);
    }

    /// Overwrite the age and size gauges.
    pub fn snapshot_gauges(&self, age_seconds: f64, size: usize) {
        metrics::gauge!(CACHE_AGE_SECONDS, "instance" => self.instance.clone()).set(age_seconds);
        metrics::gauge!(CACHE_SIZE, "instance" => self.instance.clone()).set(size as f64);
    }

    pub fn reconnect(&self) {
        metrics::counter!(CHANGE_FEED_RECONNECTS_TOTAL, "instance" => self.instance.clone())
            .increment(1);
    }

    pub fn subscription_active(&self, active: bool) {
        let value = if active { 1.0 } else { 0.0 };
        metrics::gauge!(CHANGE_FEED_SUBSCRIPTION_ACTIVE, "instance" => self.instance.clone())
            .set(value);
    }
}
