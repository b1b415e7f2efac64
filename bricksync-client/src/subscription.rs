//! Live view of one cached query.

use bricksync_cache::{CacheStore, EntryStatus, EntryView, SubscriberId};
use bricksync_core::{RequestSignature, SyncError, SyncResult};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A subscriber's handle on a cache entry.
///
/// Dropping the subscription, or cancelling the token it was created with,
/// unsubscribes. When it was the last subscriber of an entry whose fetch is
/// still in flight, that fetch is cancelled.
pub struct Subscription {
    store: Arc<CacheStore>,
    signature: RequestSignature,
    id: SubscriberId,
    events: mpsc::UnboundedReceiver<EntryView>,
    /// Child of the caller's token; cancelled on drop to stop the watcher.
    guard: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(
        store: Arc<CacheStore>,
        signature: RequestSignature,
        id: SubscriberId,
        events: mpsc::UnboundedReceiver<EntryView>,
        cancel: &CancellationToken,
    ) -> Self {
        let guard = cancel.child_token();
        let watcher_store = Arc::clone(&store);
        let watcher_guard = guard.clone();
        tokio::spawn(async move {
            watcher_guard.cancelled().await;
            watcher_store.unsubscribe(id);
        });

        Self {
            store,
            signature,
            id,
            events,
            guard,
        }
    }

    pub fn signature(&self) -> &RequestSignature {
        &self.signature
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.guard.is_cancelled()
    }

    /// Current state of the entry, without waiting.
    pub fn current(&self) -> Option<EntryView> {
        self.store.get(&self.signature)
    }

    /// Next transition, or `None` once unsubscribed.
    pub async fn next(&mut self) -> Option<EntryView> {
        tokio::select! {
            biased;
            _ = self.guard.cancelled() => None,
            view = self.events.recv() => view,
        }
    }

    /// Wait until no fetch is pending for the entry.
    pub async fn settled(&mut self) -> SyncResult<EntryView> {
        loop {
            match self.next().await {
                Some(view) if view.status.is_settled() => return Ok(view),
                Some(_) => continue,
                None => return Err(SyncError::Cancelled),
            }
        }
    }

    /// Wait for a settled value and decode it.
    ///
    /// A terminal fetch failure surfaces as its error.
    pub async fn value_as<T: DeserializeOwned>(&mut self) -> SyncResult<T> {
        let view = self.settled().await?;
        if view.status == EntryStatus::Error {
            if let Some(error) = view.error {
                return Err(error);
            }
        }
        view.value_as::<T>()?
            .ok_or_else(|| SyncError::Decode(format!("no cached value for {}", self.signature)))
    }

    /// Unsubscribe now instead of on drop.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.guard.cancel();
        self.store.unsubscribe(self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("signature", &self.signature)
            .field("id", &self.id)
            .finish()
    }
}
