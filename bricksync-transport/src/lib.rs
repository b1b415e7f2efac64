//! Bricksync Transport
//!
//! Everything between a cache miss and the network:
//!
//! - [`adapter`]: turns a [`RequestSpec`] into exactly one call on a
//!   [`Transport`], adding standard headers and honouring cancellation
//! - [`http`]: the reqwest-backed [`HttpTransport`]
//! - [`retry`]: the retry scheduler wrapping repeated adapter calls
//! - [`breaker`]: per-endpoint circuit breakers consulted by the scheduler
//! - [`metrics`]: attempt counters

pub mod adapter;
pub mod breaker;
pub mod http;
pub mod metrics;
pub mod retry;

pub use adapter::{
    AntiForgeryTokenSource, PreparedRequest, RequestSpec, StaticTokenSource, Transport,
    TransportAdapter, ANTI_FORGERY_HEADER,
};
pub use http::{Credentials, HttpTransport, HttpTransportConfig, TransportError};
pub use breaker::{CircuitBreakers, CircuitState};
pub use metrics::{RetryMetrics, RetryStats};
pub use retry::{run_guarded, run_with_retry, AttemptGuard, RetryOutcome, RetryState};
