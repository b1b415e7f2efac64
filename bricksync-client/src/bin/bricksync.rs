//! bricksync: fetch one query through the full client stack and
//! print the settled result.
//!
//! ```text
//! bricksync --config bricksync.toml --path /api/wishlist [--param key=value]...
//! ```

use bricksync_client::{init_tracing, ClientConfig, ClientResult, ConfigError, QueryDescriptor, SyncClient};
use bricksync_core::{Params, SyncError};
use tokio_util::sync::CancellationToken;

struct FetchArgs {
    path: String,
    params: Params,
}

fn parse_args() -> Result<FetchArgs, ConfigError> {
    let mut path = None;
    let mut params = Params::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--path" => path = args.next(),
            "--param" => {
                let pair = args.next().unwrap_or_default();
                let Some((key, value)) = pair.split_once('=') else {
                    return Err(ConfigError::InvalidValue {
                        field: "--param",
                        reason: format!("expected key=value, got {:?}", pair),
                    });
                };
                params.insert(key, value);
            }
            // Consumed by ClientConfig::load.
            "--config" => {
                args.next();
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "args",
                    reason: format!("unknown argument {:?}", other),
                })
            }
        }
    }

    let path = path.ok_or(ConfigError::InvalidValue {
        field: "--path",
        reason: "required".to_string(),
    })?;
    Ok(FetchArgs { path, params })
}

#[tokio::main]
async fn main() -> ClientResult<()> {
    let config = ClientConfig::load()?;
    init_tracing(config.log_format)?;
    let args = parse_args()?;

    let client = SyncClient::from_config(&config)?;
    let query = client.register_query(QueryDescriptor::new("cliFetch", args.path))?;

    let cancel = CancellationToken::new();
    let mut subscription = client.query(&query, args.params, &cancel);
    let view = tokio::select! {
        view = subscription.settled() => view?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            cancel.cancel();
            return Err(SyncError::Cancelled.into());
        }
    };

    if let Some(error) = view.error {
        return Err(error.into());
    }
    let output = serde_json::to_string_pretty(&view.value.unwrap_or_default())
        .map_err(SyncError::from)?;
    println!("{}", output);
    Ok(())
}
