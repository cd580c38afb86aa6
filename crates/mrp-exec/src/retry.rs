//! Retry/backoff controller.
//!
//! Only `Retryable` failures are retried, at most `max_retries` times, so a
//! shard gets `1 + max_retries` attempts. The delay before retry `n` (1-based)
//! is `min(initial * multiplier^(n-1), max)`, jittered by up to
//! `±jitter_factor/2` of itself.

use std::time::Duration;

use mrp_core::config::EngineConfig;
use mrp_core::record::FailureClass;
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            max_retries: cfg.retry_max_retries,
            initial: Duration::from_millis(cfg.retry_initial_backoff_ms),
            max: Duration::from_millis(cfg.retry_max_backoff_ms),
            multiplier: cfg.retry_multiplier,
            jitter_factor: cfg.retry_jitter_factor,
        }
    }

    /// No waiting between attempts; used by tests and replays of stubs.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another.
    pub fn should_retry(&self, class: FailureClass, attempt: u32) -> bool {
        class == FailureClass::Retryable && attempt <= self.max_retries
    }

    /// Un-jittered delay before retry `retry` (1-based).
    pub fn base_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi((retry - 1).min(i32::MAX as u32) as i32);
        let ms = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let range = base.as_secs_f64() * self.jitter_factor;
        if range <= 0.0 {
            return base;
        }
        let jitter = rand::rng().random_range(-range / 2.0..=range / 2.0);
        Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    #[test]
    fn exponential_then_capped() {
        let p = policy();
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(400));
        assert_eq!(p.base_delay(5), Duration::from_millis(1_000));
        assert_eq!(p.base_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_half_factor() {
        let p = policy();
        for _ in 0..200 {
            let d = p.delay(2).as_secs_f64();
            assert!((0.179..=0.221).contains(&d), "delay {d}");
        }
    }

    #[test]
    fn retry_budget_counts_retries_not_attempts() {
        let p = policy();
        assert_eq!(p.max_attempts(), 4);
        assert!(p.should_retry(FailureClass::Retryable, 3));
        assert!(!p.should_retry(FailureClass::Retryable, 4));
        assert!(!p.should_retry(FailureClass::Permanent, 1));
    }

    #[test]
    fn config_values_flow_through() {
        let cfg = EngineConfig {
            retry_max_retries: 7,
            retry_initial_backoff_ms: 10,
            ..Default::default()
        };
        let p = BackoffPolicy::from_config(&cfg);
        assert_eq!(p.max_retries, 7);
        assert_eq!(p.initial, Duration::from_millis(10));
    }
}
