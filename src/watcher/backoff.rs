//! Reconnect backoff for the change-feed watcher.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Exponential backoff between change-feed subscription attempts.
///
/// There is no attempt limit: the watcher retries forever, and the delay
/// simply stops growing at `max_delay`.
///
/// ```rust
/// # use mimir::BackoffConfig;
/// # use std::time::Duration;
/// let config = BackoffConfig::new()
///     .initial_delay(Duration::from_secs(1))
///     .max_delay(Duration::from_secs(30))
///     .jitter(false);
/// assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure. Default: 5s.
    pub initial_delay: Duration,
    /// Cap on the delay. Default: 60s.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure. Default: 2.0.
    pub multiplier: f64,
    /// Whether to add up to 10% random jitter. Default: true.
    pub jitter: bool,
    /// How long a subscription must stay up, without delivering anything,
    /// before the failure count resets. A delivered record resets it
    /// immediately. Default: 30s.
    pub stable_after: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            stable_after: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay after the first failure.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Set how long a quiet subscription must last to count as recovered.
    pub fn stable_after(mut self, period: Duration) -> Self {
        self.stable_after = period;
        self
    }

    /// Delay for a given attempt number (0-indexed), without jitter.
    ///
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay for a given attempt, with jitter applied if enabled.
    pub fn effective_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if !self.jitter {
            return base;
        }
        let spread_ms = (base.as_millis() as u64) / 10;
        if spread_ms == 0 {
            return base;
        }
        base + Duration::from_millis(clock_entropy() % spread_ms)
    }
}

/// Cheap entropy from the wall clock's sub-second part; good enough to
/// spread reconnects of many watchers apart.
fn clock_entropy() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig::new().jitter(false)
    }

    #[test]
    fn defaults_start_at_five_seconds() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(5));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert!(config.jitter);
        assert_eq!(config.stable_after, Duration::from_secs(30));
    }

    #[test]
    fn delay_doubles_until_capped() {
        let config = no_jitter();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(40));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(60));
    }

    #[test]
    fn huge_attempt_numbers_stay_capped() {
        let config = no_jitter();
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn multiplier_below_one_does_not_shrink() {
        let config = no_jitter().multiplier(0.5);
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let config = BackoffConfig::new();
        for attempt in 0..6 {
            let base = config.delay_for_attempt(attempt);
            let delay = config.effective_delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base / 10);
        }
    }
}
