//! Bricksync Client
//!
//! The composition root: declares endpoints, wires the cache to a
//! transport and exposes queries and mutations to feature code.
//!
//! ```no_run
//! use bricksync_client::{ClientConfig, QueryDescriptor, SyncClient};
//! use bricksync_core::{Params, Tag};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::load()?;
//! let client = SyncClient::from_config(&config)?;
//! let wishlist = client.register_query(
//!     QueryDescriptor::new("getWishlist", "/api/wishlist")
//!         .provides(|_, _| vec![Tag::list("Wishlist")]),
//! )?;
//!
//! let mut subscription = client.query(&wishlist, Params::new(), &CancellationToken::new());
//! let view = subscription.settled().await?;
//! println!("{:?}", view.value);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod subscription;
pub mod telemetry;

pub use client::{MutateOptions, SyncClient, SyncClientBuilder};
pub use config::{ClientConfig, ConfigError, CONFIG_ENV};
pub use endpoint::{
    EndpointRegistry, MutationDescriptor, MutationEndpoint, QueryDescriptor, QueryEndpoint, TagsFn,
};
pub use error::{ClientError, ClientResult};
pub use subscription::Subscription;
pub use telemetry::{init_tracing, LogFormat, DEFAULT_FILTER};

pub use bricksync_cache::{
    CacheStats, EntryStatus, EntryView, InvalidationReport, OptimisticRewrite, Rewrite,
};
pub use bricksync_core::{AuthFailureHook, CircuitBreakerPolicy, NoopAuthHook};
pub use bricksync_transport::{CircuitState, RetryStats};
