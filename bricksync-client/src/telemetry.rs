//! Tracing subscriber setup.

use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ClientError, ClientResult};

/// Used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str =
    "bricksync_core=debug,bricksync_transport=debug,bricksync_cache=debug,bricksync_client=debug,info";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Install the global tracing subscriber.
///
/// Call once at startup; a second call fails with [`ClientError::Telemetry`].
pub fn init_tracing(format: LogFormat) -> ClientResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).try_init(),
    };
    result.map_err(|e| ClientError::Telemetry(e.to_string()))?;

    tracing::info!(format = ?format, "Tracing initialized");
    Ok(())
}
