//! Background eviction.

use bricksync_core::{millis, RequestSignature};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::CacheStore;

/// Sweep `store` for expired entries every `interval` until `cancel` fires.
///
/// `on_evicted` sees the signatures removed by each sweep that removed any.
pub fn spawn_janitor<F>(
    store: Arc<CacheStore>,
    interval: Duration,
    cancel: CancellationToken,
    on_evicted: F,
) -> JoinHandle<()>
where
    F: Fn(&[RequestSignature]) + Send + 'static,
{
    tokio::spawn(async move {
        debug!(interval_ms = millis(interval), "Cache janitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let evicted = store.evict_expired(Instant::now());
            if !evicted.is_empty() {
                on_evicted(&evicted);
            }
        }
        debug!("Cache janitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bricksync_core::{CacheClass, TagSet};
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn test_janitor_evicts_after_retention_window() {
        let store = Arc::new(CacheStore::default());
        let signature = RequestSignature::bare("getWishlist");
        store.put(&signature, json!([]), TagSet::new(), CacheClass::Short);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cancel = CancellationToken::new();
        let handle = spawn_janitor(store.clone(), Duration::from_secs(10), cancel.clone(), move |evicted| {
            sink.lock().unwrap().extend_from_slice(evicted)
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(store.contains(&signature));
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!store.contains(&signature));
        assert_eq!(*seen.lock().unwrap(), vec![signature]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
