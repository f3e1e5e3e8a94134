//! Operator-facing health report.
//!
//! Built from non-blocking reads of every cache and watcher, so producing a
//! report never triggers a reload or waits on a watcher.

use std::time::Duration;

use serde::Serialize;

use crate::cache::CacheHealth;
use crate::watcher::{WatcherState, WatcherStatus};

/// Health of one cache instance and its watcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceHealth {
    pub name: String,
    pub cache_size: usize,
    /// `None` if the cache was never loaded.
    pub cache_age_seconds: Option<f64>,
    pub change_feed_subscription_active: bool,
    /// A read right now would be served without a reload.
    pub cache_valid: bool,
    /// At least one load ever succeeded (possibly with zero items).
    pub cache_loaded: bool,
    pub watcher_status: WatcherStatus,
    pub consecutive_failures: u32,
}

impl InstanceHealth {
    pub fn new(name: impl Into<String>, cache: &CacheHealth, watcher: &WatcherState) -> Self {
        Self {
            name: name.into(),
            cache_size: cache.size,
            cache_age_seconds: cache.age_seconds,
            change_feed_subscription_active: watcher.subscription_active,
            cache_valid: cache.valid,
            cache_loaded: cache.loaded,
            watcher_status: watcher.status,
            consecutive_failures: watcher.consecutive_failures,
        }
    }

    /// Never loaded, or last loaded longer than `max_age` ago.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match self.cache_age_seconds {
            Some(age) => age > max_age.as_secs_f64(),
            None => true,
        }
    }
}

/// Health of every registered cache instance, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub caches: Vec<InstanceHealth>,
}

impl HealthReport {
    pub fn get(&self, name: &str) -> Option<&InstanceHealth> {
        self.caches.iter().find(|c| c.name == name)
    }

    /// Names of instances that are stale per [`InstanceHealth::is_stale`].
    pub fn stale_instances(&self, max_age: Duration) -> Vec<&str> {
        self.caches
            .iter()
            .filter(|c| c.is_stale(max_age))
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Every instance is loaded, subscribed and no older than `max_age`.
    pub fn is_healthy(&self, max_age: Duration) -> bool {
        self.caches
            .iter()
            .all(|c| c.cache_loaded && c.change_feed_subscription_active && !c.is_stale(max_age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, age: Option<f64>, subscribed: bool) -> InstanceHealth {
        InstanceHealth {
            name: name.to_string(),
            cache_size: 2,
            cache_age_seconds: age,
            change_feed_subscription_active: subscribed,
            cache_valid: age.is_some(),
            cache_loaded: age.is_some(),
            watcher_status: if subscribed {
                WatcherStatus::Subscribed
            } else {
                WatcherStatus::Backoff
            },
            consecutive_failures: 0,
        }
    }

    #[test]
    fn stale_instances_include_never_loaded() {
        let report = HealthReport {
            caches: vec![
                instance("fresh", Some(3.0), true),
                instance("old", Some(900.0), true),
                instance("cold", None, true),
            ],
        };
        assert_eq!(
            report.stale_instances(Duration::from_secs(600)),
            vec!["old", "cold"]
        );
        assert!(!report.is_healthy(Duration::from_secs(600)));
    }

    #[test]
    fn healthy_requires_subscription() {
        let report = HealthReport {
            caches: vec![instance("a", Some(1.0), true), instance("b", Some(1.0), false)],
        };
        assert!(report.stale_instances(Duration::from_secs(60)).is_empty());
        assert!(!report.is_healthy(Duration::from_secs(60)));
        assert!(report.get("b").is_some());
    }

    #[test]
    fn serializes_with_snake_case_status() {
        let report = HealthReport {
            caches: vec![instance("a", Some(1.5), true)],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["caches"][0]["watcher_status"], "subscribed");
        assert_eq!(json["caches"][0]["cache_age_seconds"], 1.5);
    }
}
