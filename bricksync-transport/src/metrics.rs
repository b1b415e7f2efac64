//! Retry counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live attempt counters shared by every retried request of a client.
#[derive(Debug, Default)]
pub struct RetryMetrics {
    total_attempts: AtomicU64,
    successful_attempts: AtomicU64,
    failed_attempts: AtomicU64,
    /// Attempts after the first one of a request.
    retries: AtomicU64,
    /// Attempts refused by an open circuit.
    circuit_breaker_trips: AtomicU64,
}

impl RetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attempt_started(&self, attempt: u32) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn attempt_succeeded(&self) {
        self.successful_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn attempt_failed(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn circuit_rejected(&self) {
        self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RetryStats {
        RetryStats {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successful_attempts: self.successful_attempts.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.total_attempts.store(0, Ordering::Relaxed);
        self.successful_attempts.store(0, Ordering::Relaxed);
        self.failed_attempts.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.circuit_breaker_trips.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of [`RetryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    pub retries: u64,
    pub circuit_breaker_trips: u64,
}

impl RetryStats {
    /// Share of attempts that succeeded (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            self.successful_attempts as f64 / self.total_attempts as f64
        }
    }
}
