//! Per-endpoint circuit breakers.
//!
//! A run of transient failures against one endpoint opens its circuit and
//! further calls are rejected without touching the network. Once the
//! recovery timeout has passed the circuit lets calls through again
//! (half-open); the next success closes it, the next failure reopens it.

use bricksync_core::CircuitBreakerPolicy;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// Calls flow while the endpoint proves it recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
        }
    }
}

/// Circuit breakers keyed by endpoint name.
pub struct CircuitBreakers {
    policy: CircuitBreakerPolicy,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(CircuitBreakerPolicy::default())
    }
}

impl CircuitBreakers {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self {
            policy,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.lock()
            .get(endpoint)
            .map_or(CircuitState::Closed, |circuit| circuit.state)
    }

    /// Whether a call to `endpoint` may go out now.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// and admits the call.
    pub fn try_acquire(&self, endpoint: &str) -> bool {
        if !self.policy.enabled {
            return true;
        }
        let mut circuits = self.lock();
        let Some(circuit) = circuits.get_mut(endpoint) else {
            return true;
        };
        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = circuit
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.policy.recovery_timeout());
                if recovered {
                    circuit.state = CircuitState::HalfOpen;
                    info!(endpoint, "Circuit half-open");
                }
                recovered
            }
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        if !self.policy.enabled {
            return;
        }
        let mut circuits = self.lock();
        if let Some(circuit) = circuits.get_mut(endpoint) {
            if circuit.state != CircuitState::Closed {
                info!(endpoint, "Circuit closed");
            }
            *circuit = Circuit::default();
        }
    }

    pub fn record_failure(&self, endpoint: &str) {
        if !self.policy.enabled {
            return;
        }
        let mut circuits = self.lock();
        let circuit = circuits.entry(endpoint.to_string()).or_default();
        circuit.failures = circuit.failures.saturating_add(1);
        let trips = circuit.state == CircuitState::HalfOpen
            || (circuit.state == CircuitState::Closed
                && circuit.failures >= self.policy.failure_threshold);
        if trips {
            circuit.state = CircuitState::Open;
            circuit.opened_at = Some(Instant::now());
            warn!(endpoint, failures = circuit.failures, "Circuit opened");
        }
    }

    pub fn reset(&self, endpoint: &str) {
        self.lock().remove(endpoint);
    }

    pub fn reset_all(&self) {
        self.lock().clear();
    }
}

impl fmt::Debug for CircuitBreakers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakers")
            .field("policy", &self.policy)
            .field("circuits", &self.lock().len())
            .finish()
    }
}
