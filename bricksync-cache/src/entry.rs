//! Cache entries and the view handed to subscribers.

use bricksync_core::{CacheClass, RequestSignature, SyncError, TagSet, Timestamp};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::store::{FetchId, SubscriberId};

/// Lifecycle status of a cache entry.
///
/// An entry that does not exist is `Absent`; that state is represented by
/// the entry's absence from the store rather than by a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    /// Value is current.
    Fresh,
    /// Value may be outdated and should be refetched when observed.
    Stale,
    /// A network fetch is in flight. The previous value, if any, is kept.
    Fetching,
    /// The last fetch failed terminally.
    Error,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Fresh => "fresh",
            EntryStatus::Stale => "stale",
            EntryStatus::Fetching => "fetching",
            EntryStatus::Error => "error",
        }
    }

    /// Whether a fetch is no longer pending.
    pub fn is_settled(&self) -> bool {
        !matches!(self, EntryStatus::Fetching)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub id: FetchId,
    pub cancel: CancellationToken,
}

/// Store-owned entry state.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub signature: RequestSignature,
    pub value: Option<Value>,
    pub tags: TagSet,
    pub status: EntryStatus,
    pub error: Option<SyncError>,
    pub cache_class: CacheClass,
    /// Wall-clock time of the last server result.
    pub last_result_at: Option<Timestamp>,
    /// Monotonic time of the last server result, for max-age checks.
    pub fetched_at: Option<Instant>,
    /// Set when the subscriber count dropped to zero.
    pub idle_since: Option<Instant>,
    pub in_flight: Option<InFlight>,
    /// An invalidation hit this entry while its fetch was in flight.
    pub invalidated_during_fetch: bool,
    /// Bumped on every server-provided value; optimistic rewrites leave it.
    pub server_version: u64,
    /// Subscribers in subscription order.
    pub subscribers: Vec<SubscriberId>,
}

impl CacheEntry {
    pub fn new(signature: RequestSignature, cache_class: CacheClass, tags: TagSet) -> Self {
        Self {
            signature,
            value: None,
            tags,
            status: EntryStatus::Stale,
            error: None,
            cache_class,
            last_result_at: None,
            fetched_at: None,
            idle_since: None,
            in_flight: None,
            invalidated_during_fetch: false,
            server_version: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn view(&self) -> EntryView {
        EntryView {
            signature: self.signature.clone(),
            status: self.status,
            value: self.value.clone(),
            error: self.error.clone(),
            tags: self.tags.clone(),
            subscriber_count: self.subscriber_count(),
            last_result_at: self.last_result_at,
            server_version: self.server_version,
        }
    }
}

/// Point-in-time copy of an entry.
///
/// Subscribers receive one of these for every transition of their entry.
#[derive(Debug, Clone)]
pub struct EntryView {
    pub signature: RequestSignature,
    pub status: EntryStatus,
    pub value: Option<Value>,
    pub error: Option<SyncError>,
    pub tags: TagSet,
    pub subscriber_count: usize,
    pub last_result_at: Option<Timestamp>,
    pub server_version: u64,
}

impl EntryView {
    /// Decode the cached value into a caller type.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<Option<T>, SyncError> {
        match &self.value {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}
