//! Client setup errors.

use bricksync_core::SyncError;
use bricksync_transport::TransportError;

use crate::config::ConfigError;

/// Errors raised while building or wiring a [`crate::SyncClient`].
///
/// Request-level failures are [`SyncError`]s; this type only wraps them so
/// setup code can use one `?` chain.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Endpoint already registered: {name}")]
    DuplicateEndpoint { name: String },

    #[error("Failed to init tracing subscriber: {0}")]
    Telemetry(String),

    #[error("A tokio runtime is required: {0}")]
    Runtime(String),
}

/// Result type alias for client setup.
pub type ClientResult<T> = Result<T, ClientError>;
