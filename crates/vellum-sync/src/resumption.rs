//! Reconnect backoff.
//!
//! The delay after the n-th consecutive failure is
//! `interval * multiplier^(n-1)`, capped at the maximum, minus a random
//! jitter of up to `delay / jitter_divisor`.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vellum_common::config::SyncClientConfig;
use vellum_common::constants::{
    DEFAULT_DELAY_JITTER_DIVISOR, DEFAULT_MAX_RESUMPTION_DELAY_MS,
    DEFAULT_RESUMPTION_BACKOFF_MULTIPLIER, DEFAULT_RESUMPTION_DELAY_MS,
};

/// Parameters of the reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumptionDelayInfo {
    /// Delay after the first failure.
    pub resumption_delay_interval: Duration,
    /// Upper bound on the delay.
    pub max_resumption_delay_interval: Duration,
    /// Growth factor per consecutive failure.
    pub resumption_delay_backoff_multiplier: u32,
    /// Jitter is at most `delay / delay_jitter_divisor`.
    pub delay_jitter_divisor: u32,
}

impl Default for ResumptionDelayInfo {
    fn default() -> Self {
        Self {
            resumption_delay_interval: Duration::from_millis(DEFAULT_RESUMPTION_DELAY_MS),
            max_resumption_delay_interval: Duration::from_millis(DEFAULT_MAX_RESUMPTION_DELAY_MS),
            resumption_delay_backoff_multiplier: DEFAULT_RESUMPTION_BACKOFF_MULTIPLIER,
            delay_jitter_divisor: DEFAULT_DELAY_JITTER_DIVISOR,
        }
    }
}

impl ResumptionDelayInfo {
    /// Takes the parameters from a client configuration.
    #[must_use]
    pub fn from_config(config: &SyncClientConfig) -> Self {
        Self {
            resumption_delay_interval: config.resumption_delay_interval(),
            max_resumption_delay_interval: config.max_resumption_delay_interval(),
            resumption_delay_backoff_multiplier: config.resumption_delay_backoff_multiplier,
            delay_jitter_divisor: config.delay_jitter_divisor,
        }
    }

    /// Delay before jitter after `failures` consecutive failures.
    #[must_use]
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let mut delay = self.resumption_delay_interval;
        for _ in 1..failures {
            if delay >= self.max_resumption_delay_interval {
                break;
            }
            delay = delay.saturating_mul(self.resumption_delay_backoff_multiplier.max(1));
        }
        delay.min(self.max_resumption_delay_interval)
    }
}

/// Consecutive failure counter producing jittered delays.
#[derive(Debug)]
pub struct ResumptionBackoff {
    info: ResumptionDelayInfo,
    failures: u32,
    rng: StdRng,
}

impl ResumptionBackoff {
    /// Creates a backoff seeded from the OS.
    #[must_use]
    pub fn new(info: ResumptionDelayInfo) -> Self {
        Self::with_rng(info, StdRng::from_entropy())
    }

    /// Creates a backoff with a fixed seed.
    #[must_use]
    pub fn with_seed(info: ResumptionDelayInfo, seed: u64) -> Self {
        Self::with_rng(info, StdRng::seed_from_u64(seed))
    }

    fn with_rng(info: ResumptionDelayInfo, rng: StdRng) -> Self {
        Self {
            info,
            failures: 0,
            rng,
        }
    }

    /// Parameters in use.
    #[must_use]
    pub fn info(&self) -> &ResumptionDelayInfo {
        &self.info
    }

    /// Replaces the parameters, e.g. with a server supplied backoff.
    pub fn set_info(&mut self, info: ResumptionDelayInfo) {
        self.info = info;
    }

    /// Consecutive failures so far.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a failure and returns how long to wait before reconnecting.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.info.delay_for_attempt(self.failures);
        let divisor = self.info.delay_jitter_divisor.max(1);
        let max_jitter = delay / divisor;
        if max_jitter.is_zero() {
            return delay;
        }
        let jitter = self.rng.gen_range(Duration::ZERO..=max_jitter);
        delay - jitter
    }

    /// Forgets past failures after a successful connection.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_from_one_second() {
        let info = ResumptionDelayInfo::default();
        assert_eq!(info.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(info.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(info.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(info.delay_for_attempt(9), Duration::from_secs(256));
        assert_eq!(info.delay_for_attempt(10), Duration::from_secs(300));
        assert_eq!(info.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let mut backoff = ResumptionBackoff::with_seed(ResumptionDelayInfo::default(), 7);
        for attempt in 1..=40u32 {
            let base = backoff.info().delay_for_attempt(attempt);
            let delay = backoff.next_delay();
            assert!(delay <= base, "attempt {attempt}: {delay:?} > {base:?}");
            assert!(delay >= base - base / 4, "attempt {attempt}: {delay:?}");
            assert!(delay <= Duration::from_secs(300));
        }
        assert_eq!(backoff.failures(), 40);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = ResumptionBackoff::with_seed(ResumptionDelayInfo::default(), 1);
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_secs(1));
        assert!(delay >= Duration::from_millis(750));
    }

    #[test]
    fn test_same_seed_same_delays() {
        let info = ResumptionDelayInfo::default();
        let mut a = ResumptionBackoff::with_seed(info, 42);
        let mut b = ResumptionBackoff::with_seed(info, 42);
        for _ in 0..5 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }
}
