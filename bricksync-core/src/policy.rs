//! Retry and cache-duration policies.
//!
//! Endpoints do not carry their own timing constants. Every query picks one of
//! a handful of shared [`CacheClass`]es, and every request shares one
//! [`RetryPolicy`], so tuning happens in one place.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// RETRY
// ============================================================================

/// Linear backoff policy for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `base_delay_ms * n`.
    pub base_delay_ms: u64,
    /// Upper bound on the computed delay. `Retry-After` may exceed it.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    /// Random extra delay in `0..=jitter_ms`.
    #[serde(default)]
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: Some(10_000),
            jitter_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: millis(base_delay),
            max_delay_ms: None,
            jitter_ms: 0,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = Some(millis(max_delay));
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter_ms = millis(jitter);
        self
    }

    /// Attempt budget, never below one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// `retry_after` from the server is a floor, not a replacement.
    pub fn delay_after(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let mut delay_ms = self.base_delay_ms.saturating_mul(u64::from(attempt.max(1)));
        if let Some(max) = self.max_delay_ms {
            delay_ms = delay_ms.min(max);
        }
        let computed = Duration::from_millis(delay_ms);
        match retry_after {
            Some(floor) if floor > computed => floor,
            _ => computed,
        }
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Per-endpoint circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerPolicy {
    pub enabled: bool,
    /// Consecutive transient failures that open the circuit.
    pub failure_threshold: u32,
    /// Time an open circuit rejects calls before letting one through.
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

// ============================================================================
// CACHE CLASSES
// ============================================================================

/// Named cache-duration class shared by endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheClass {
    /// Always refetch on subscribe, evict as soon as unused.
    None,
    /// Frequently changing data.
    Short,
    /// Moderately changing data.
    #[default]
    Medium,
    /// Rarely changing data.
    Long,
    /// Kept until explicitly invalidated.
    Persistent,
}

impl CacheClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheClass::None => "none",
            CacheClass::Short => "short",
            CacheClass::Medium => "medium",
            CacheClass::Long => "long",
            CacheClass::Persistent => "persistent",
        }
    }
}

/// Timing for one cache class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CachePolicy {
    /// How long an entry with no subscribers survives. `None` keeps it forever.
    pub keep_unused_for_secs: Option<u64>,
    /// Age after which a new subscriber triggers a refetch. `None` never does.
    pub max_age_secs: Option<u64>,
}

impl CachePolicy {
    pub const fn new(keep_unused_for_secs: Option<u64>, max_age_secs: Option<u64>) -> Self {
        Self {
            keep_unused_for_secs,
            max_age_secs,
        }
    }

    pub fn keep_unused_for(&self) -> Option<Duration> {
        self.keep_unused_for_secs.map(Duration::from_secs)
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

/// Policy for every cache class. Missing classes keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CachePolicyTable {
    pub none: CachePolicy,
    pub short: CachePolicy,
    pub medium: CachePolicy,
    pub long: CachePolicy,
    pub persistent: CachePolicy,
}

impl Default for CachePolicyTable {
    fn default() -> Self {
        Self {
            none: CachePolicy::new(Some(0), Some(0)),
            short: CachePolicy::new(Some(30), Some(30)),
            medium: CachePolicy::new(Some(300), Some(300)),
            long: CachePolicy::new(Some(1800), Some(1800)),
            persistent: CachePolicy::new(None, None),
        }
    }
}

impl CachePolicyTable {
    pub fn policy(&self, class: CacheClass) -> CachePolicy {
        match class {
            CacheClass::None => self.none,
            CacheClass::Short => self.short,
            CacheClass::Medium => self.medium,
            CacheClass::Long => self.long,
            CacheClass::Persistent => self.persistent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_after(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3, None), Duration::from_millis(300));
    }

    #[test]
    fn test_max_delay_caps_computed_delay() {
        let policy =
            RetryPolicy::new(10, Duration::from_millis(1000)).with_max_delay(Duration::from_millis(2500));
        assert_eq!(policy.delay_after(5, None), Duration::from_millis(2500));
    }

    #[test]
    fn test_retry_after_is_a_floor() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(
            policy.delay_after(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay_after(2, Some(Duration::from_millis(50))),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn test_huge_durations_saturate() {
        assert_eq!(millis(Duration::MAX), u64::MAX);
        assert_eq!(millis(Duration::from_millis(1500)), 1500);

        let policy = RetryPolicy::new(3, Duration::MAX)
            .with_max_delay(Duration::MAX)
            .with_jitter(Duration::from_secs(u64::MAX));
        assert_eq!(policy.base_delay_ms, u64::MAX);
        assert_eq!(policy.max_delay_ms, Some(u64::MAX));
        assert_eq!(policy.jitter_ms, u64::MAX);
    }

    #[test]
    fn test_circuit_breaker_defaults() {
        let policy: CircuitBreakerPolicy = serde_json::from_str(r#"{"failure_threshold": 2}"#).unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.failure_threshold, 2);
        assert_eq!(policy.recovery_timeout(), Duration::from_secs(30));
        assert!(!CircuitBreakerPolicy::disabled().enabled);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = RetryPolicy::new(0, Duration::from_millis(100));
        assert_eq!(policy.attempts(), 1);
        assert_eq!(RetryPolicy::no_retry().attempts(), 1);
    }

    #[test]
    fn test_default_cache_table() {
        let table = CachePolicyTable::default();
        assert_eq!(
            table.policy(CacheClass::Medium).keep_unused_for(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(table.policy(CacheClass::Persistent).keep_unused_for(), None);
        assert_eq!(table.policy(CacheClass::None).max_age(), Some(Duration::ZERO));
        assert_eq!(CacheClass::default(), CacheClass::Medium);
    }

    #[test]
    fn test_retry_policy_deserializes_with_defaults() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 4, "base_delay_ms": 250}"#).unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.max_delay_ms, None);
        assert_eq!(policy.jitter_ms, 0);
    }

    #[test]
    fn test_partial_cache_table_keeps_defaults() {
        let table: CachePolicyTable = serde_json::from_str(
            r#"{"short": {"keep_unused_for_secs": 5, "max_age_secs": 5}}"#,
        )
        .unwrap();
        assert_eq!(table.short, CachePolicy::new(Some(5), Some(5)));
        assert_eq!(table.long, CachePolicyTable::default().long);
    }
}
