//! Retry scheduler.
//!
//! Wraps repeated single attempts. Only transient failures are retried; the
//! wait between attempts grows linearly and can be interrupted by the
//! cancellation token. [`run_guarded`] additionally consults a circuit
//! breaker before each attempt and feeds the retry counters.

use bricksync_core::{classify, millis, Cancelled, Disposition, Response, RetryPolicy};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::breaker::CircuitBreakers;
use crate::metrics::RetryMetrics;

/// Progress of one logical request through its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Number of the attempt most recently started (1-based).
    pub attempt: u32,
    /// Wait before the next attempt, if one is scheduled.
    pub next_delay: Option<Duration>,
    /// Disposition of the last failed attempt.
    pub disposition: Option<Disposition>,
}

/// Final result of a retried request.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// The last attempt produced a response. `disposition` is `None` on success.
    Completed {
        response: Response,
        attempts: u32,
        disposition: Option<Disposition>,
    },
    /// Cancelled during an attempt or a backoff wait.
    Cancelled { attempts: u32 },
    /// The endpoint's circuit was open before the first attempt.
    CircuitOpen,
}

impl RetryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Completed { attempts, .. } | RetryOutcome::Cancelled { attempts } => {
                *attempts
            }
            RetryOutcome::CircuitOpen => 0,
        }
    }
}

/// Circuit breaker and counters consulted around every attempt of one
/// endpoint's request.
#[derive(Debug, Clone, Copy)]
pub struct AttemptGuard<'a> {
    pub endpoint: &'a str,
    pub breakers: &'a CircuitBreakers,
    pub metrics: &'a RetryMetrics,
}

impl AttemptGuard<'_> {
    fn record(&self, response: &Response) {
        match response {
            Response::Ok(_) => {
                self.metrics.attempt_succeeded();
                self.breakers.record_success(self.endpoint);
            }
            Response::Failed(failure) => {
                self.metrics.attempt_failed();
                // Only failures that say the endpoint is unhealthy count
                // towards opening the circuit.
                if classify(failure).is_retryable() {
                    self.breakers.record_failure(self.endpoint);
                }
            }
        }
    }
}

/// Run `operation` until it succeeds, fails terminally or the attempt budget
/// is spent.
///
/// `operation` receives the 1-based attempt number.
pub async fn run_with_retry<F, Fut>(operation: F, policy: &RetryPolicy, cancel: &CancellationToken) -> RetryOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Response, Cancelled>>,
{
    run_guarded(operation, policy, cancel, None).await
}

/// [`run_with_retry`] behind a circuit breaker.
///
/// The circuit is checked before every attempt. A circuit that is open
/// before the first attempt yields [`RetryOutcome::CircuitOpen`]; one that
/// opens between attempts ends the request with the last failure.
pub async fn run_guarded<F, Fut>(
    mut operation: F,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    guard: Option<AttemptGuard<'_>>,
) -> RetryOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Response, Cancelled>>,
{
    let max_attempts = policy.attempts();
    let mut state = RetryState {
        attempt: 0,
        next_delay: None,
        disposition: None,
    };
    let mut last_failure: Option<Response> = None;

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled {
                attempts: state.attempt,
            };
        }
        if let Some(guard) = &guard {
            if !guard.breakers.try_acquire(guard.endpoint) {
                guard.metrics.circuit_rejected();
                debug!(endpoint = guard.endpoint, attempt = state.attempt + 1, "Circuit open, attempt refused");
                return match last_failure.take() {
                    Some(response) => RetryOutcome::Completed {
                        response,
                        attempts: state.attempt,
                        disposition: state.disposition,
                    },
                    None => RetryOutcome::CircuitOpen,
                };
            }
        }
        state.attempt += 1;
        if let Some(guard) = &guard {
            guard.metrics.attempt_started(state.attempt);
        }

        let response = match operation(state.attempt).await {
            Ok(response) => response,
            Err(Cancelled) => {
                return RetryOutcome::Cancelled {
                    attempts: state.attempt,
                }
            }
        };
        if let Some(guard) = &guard {
            guard.record(&response);
        }

        let failure = match &response {
            Response::Ok(_) => {
                return RetryOutcome::Completed {
                    response,
                    attempts: state.attempt,
                    disposition: None,
                }
            }
            Response::Failed(failure) => failure,
        };

        let disposition = classify(failure);
        state.disposition = Some(disposition);
        if !disposition.is_retryable() || state.attempt >= max_attempts {
            debug!(
                attempt = state.attempt,
                status = %failure.status,
                disposition = %disposition,
                "Giving up on request"
            );
            return RetryOutcome::Completed {
                response,
                attempts: state.attempt,
                disposition: Some(disposition),
            };
        }

        let delay = policy.delay_after(state.attempt, failure.retry_after) + jitter(policy.jitter_ms);
        state.next_delay = Some(delay);
        warn!(
            attempt = state.attempt,
            max_attempts,
            status = %failure.status,
            delay_ms = millis(delay),
            "Transient failure, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(attempt = state.attempt, "Cancelled during backoff");
                return RetryOutcome::Cancelled { attempts: state.attempt };
            }
            _ = tokio::time::sleep(delay) => {}
        }
        state.next_delay = None;
        last_failure = Some(response);
    }
}

fn jitter(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}
