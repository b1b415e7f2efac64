//! Cache store.
//!
//! Owns every [`CacheEntry`]. Callers interact through signatures and
//! subscriber ids; fetches are driven outside the store and reported back
//! with the [`FetchTicket`] the store handed out, so a result that arrives
//! after its entry was cancelled or refetched is recognised and dropped.

use bricksync_core::{CacheClass, CachePolicy, CachePolicyTable, RequestSignature, SyncError, TagSet};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::entry::{CacheEntry, EntryStatus, EntryView, InFlight};
use crate::optimistic::{EntrySnapshot, Rewrite};
use crate::stats::CacheStats;

// ============================================================================
// HANDLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchId(u64);

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch-{}", self.0)
    }
}

/// Permission to run the single in-flight fetch for a signature.
#[derive(Debug, Clone)]
pub struct FetchTicket {
    pub signature: RequestSignature,
    pub id: FetchId,
    /// Cancelled when the last subscriber leaves.
    pub cancel: CancellationToken,
}

/// What a new subscriber must do.
#[derive(Debug)]
pub enum FetchDecision {
    /// Run this fetch and report the result back.
    Start(FetchTicket),
    /// A fetch is already in flight; wait for its notification.
    Attached,
    /// The cached value is usable as is.
    Cached,
}

/// Result of [`CacheStore::subscribe`].
#[derive(Debug)]
pub struct Subscribed {
    pub id: SubscriberId,
    /// Every transition of the entry, starting with its current state.
    pub events: mpsc::UnboundedReceiver<EntryView>,
    pub decision: FetchDecision,
}

/// How a fetch result was taken by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The ticket no longer owns the entry; the result was dropped.
    Ignored,
    Applied {
        status: EntryStatus,
        /// The result landed `Stale` while subscribers are still watching.
        needs_refetch: bool,
    },
}

// ============================================================================
// STORE
// ============================================================================

struct SubscriberSlot {
    signature: RequestSignature,
    sender: mpsc::UnboundedSender<EntryView>,
}

#[derive(Default)]
pub(crate) struct StoreInner {
    pub(crate) entries: HashMap<RequestSignature, CacheEntry>,
    subscribers: HashMap<SubscriberId, SubscriberSlot>,
    next_subscriber: u64,
    next_fetch: u64,
    /// Source of `server_version`; shared by every entry so a recreated
    /// entry never repeats a version an older snapshot holds.
    next_version: u64,
    pub(crate) stats: CacheStats,
}

impl StoreInner {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Send the entry's current view to each of its subscribers.
    pub(crate) fn notify(&self, signature: &RequestSignature) {
        let Some(entry) = self.entries.get(signature) else {
            return;
        };
        let view = entry.view();
        for id in &entry.subscribers {
            if let Some(slot) = self.subscribers.get(id) {
                // A dropped receiver unsubscribes on its own.
                let _ = slot.sender.send(view.clone());
            }
        }
    }

    fn start_fetch(&mut self, signature: &RequestSignature) -> Option<FetchTicket> {
        let id = FetchId(self.next_fetch);
        let entry = self.entries.get_mut(signature)?;
        if entry.in_flight.is_some() {
            return None;
        }
        self.next_fetch += 1;

        let cancel = CancellationToken::new();
        entry.in_flight = Some(InFlight {
            id,
            cancel: cancel.clone(),
        });
        entry.status = EntryStatus::Fetching;
        entry.invalidated_during_fetch = false;
        self.stats.fetches_started += 1;
        debug!(signature = %signature, fetch = %id, "Fetch started");

        self.notify(signature);
        Some(FetchTicket {
            signature: signature.clone(),
            id,
            cancel,
        })
    }

    /// Entry owned by `ticket`, with its in-flight marker cleared.
    fn take_owned(&mut self, ticket: &FetchTicket) -> Option<&mut CacheEntry> {
        let entry = self.entries.get_mut(&ticket.signature)?;
        let owned = matches!(&entry.in_flight, Some(in_flight) if in_flight.id == ticket.id);
        if !owned {
            debug!(signature = %ticket.signature, fetch = %ticket.id, "Dropping result of superseded fetch");
            return None;
        }
        entry.in_flight = None;
        Some(entry)
    }
}

/// Shared, tag-indexed result cache.
pub struct CacheStore {
    inner: Mutex<StoreInner>,
    policies: CachePolicyTable,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(CachePolicyTable::default())
    }
}

impl CacheStore {
    pub fn new(policies: CachePolicyTable) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            policies,
        }
    }

    pub fn policies(&self) -> &CachePolicyTable {
        &self.policies
    }

    /// Every critical section leaves the store consistent, so a poisoned
    /// lock is still safe to use.
    pub(crate) fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn get(&self, signature: &RequestSignature) -> Option<EntryView> {
        self.lock().entries.get(signature).map(CacheEntry::view)
    }

    pub fn contains(&self, signature: &RequestSignature) -> bool {
        self.lock().entries.contains_key(signature)
    }

    pub fn subscriber_count(&self, signature: &RequestSignature) -> usize {
        self.lock()
            .entries
            .get(signature)
            .map_or(0, CacheEntry::subscriber_count)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entry_count: inner.entries.len() as u64,
            ..inner.stats
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store a server-provided value directly.
    pub fn put(&self, signature: &RequestSignature, value: Value, tags: TagSet, class: CacheClass) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let now = Instant::now();
        let version = inner.bump_version();
        let entry = inner
            .entries
            .entry(signature.clone())
            .or_insert_with(|| CacheEntry::new(signature.clone(), class, TagSet::new()));

        entry.value = Some(value);
        entry.tags = tags;
        entry.error = None;
        if entry.in_flight.is_none() {
            entry.status = EntryStatus::Fresh;
        }
        entry.fetched_at = Some(now);
        entry.last_result_at = Some(Utc::now());
        entry.server_version = version;
        if entry.subscribers.is_empty() && entry.idle_since.is_none() {
            entry.idle_since = Some(now);
        }
        inner.notify(signature);
    }

    /// Register interest in `signature`.
    ///
    /// Creates the entry on first use and decides whether this subscriber
    /// has to start the fetch. At most one fetch per signature is ever in
    /// flight.
    pub fn subscribe(&self, signature: &RequestSignature, class: CacheClass, tags: TagSet) -> Subscribed {
        let (sender, events) = mpsc::unbounded_channel();
        let now = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let id = SubscriberId(inner.next_subscriber);
        inner.next_subscriber += 1;
        inner.subscribers.insert(
            id,
            SubscriberSlot {
                signature: signature.clone(),
                sender,
            },
        );

        let entry = inner
            .entries
            .entry(signature.clone())
            .or_insert_with(|| CacheEntry::new(signature.clone(), class, tags));
        entry.subscribers.push(id);
        entry.idle_since = None;

        let in_flight = entry.in_flight.is_some();
        let needs_fetch = needs_fetch(entry, self.policies.policy(entry.cache_class), now);

        let decision = if in_flight {
            inner.stats.deduplicated += 1;
            debug!(signature = %signature, subscriber = %id, "Attached to in-flight fetch");
            FetchDecision::Attached
        } else if needs_fetch {
            inner.stats.misses += 1;
            match inner.start_fetch(signature) {
                Some(ticket) => FetchDecision::Start(ticket),
                None => FetchDecision::Attached,
            }
        } else {
            inner.stats.hits += 1;
            FetchDecision::Cached
        };

        // start_fetch already told every subscriber, this one included.
        if !matches!(decision, FetchDecision::Start(_)) {
            if let (Some(entry), Some(slot)) = (inner.entries.get(signature), inner.subscribers.get(&id)) {
                let _ = slot.sender.send(entry.view());
            }
        }

        Subscribed { id, events, decision }
    }

    /// Drop a subscriber.
    ///
    /// When the last subscriber leaves, eviction is scheduled; if a fetch is
    /// still in flight it is cancelled and the entry removed right away.
    /// Returns `false` for an unknown id.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(slot) = inner.subscribers.remove(&id) else {
            return false;
        };
        let Some(entry) = inner.entries.get_mut(&slot.signature) else {
            return true;
        };

        entry.subscribers.retain(|s| *s != id);
        if entry.subscribers.is_empty() {
            if let Some(in_flight) = entry.in_flight.take() {
                in_flight.cancel.cancel();
                inner.entries.remove(&slot.signature);
                inner.stats.cancelled_fetches += 1;
                debug!(signature = %slot.signature, fetch = %in_flight.id, "Last subscriber left, fetch cancelled");
            } else {
                entry.idle_since = Some(Instant::now());
            }
        }
        true
    }

    // ========================================================================
    // FETCH LIFECYCLE
    // ========================================================================

    /// Start a fetch for an existing entry unless one is already in flight.
    pub fn begin_fetch(&self, signature: &RequestSignature) -> Option<FetchTicket> {
        self.lock().start_fetch(signature)
    }

    pub fn complete_fetch(&self, ticket: &FetchTicket, value: Value, tags: TagSet) -> Settlement {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let version = inner.bump_version();
        let Some(entry) = inner.take_owned(ticket) else {
            return Settlement::Ignored;
        };

        entry.value = Some(value);
        entry.tags = tags;
        entry.error = None;
        entry.status = if entry.invalidated_during_fetch {
            EntryStatus::Stale
        } else {
            EntryStatus::Fresh
        };
        entry.invalidated_during_fetch = false;
        entry.fetched_at = Some(Instant::now());
        entry.last_result_at = Some(Utc::now());
        entry.server_version = version;

        let status = entry.status;
        let needs_refetch = status == EntryStatus::Stale && entry.subscriber_count() > 0;
        debug!(signature = %ticket.signature, status = %status, "Fetch completed");
        inner.notify(&ticket.signature);
        Settlement::Applied {
            status,
            needs_refetch,
        }
    }

    /// Record a terminal failure. The last good value is kept.
    pub fn fail_fetch(&self, ticket: &FetchTicket, error: SyncError) -> Settlement {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.take_owned(ticket) else {
            return Settlement::Ignored;
        };

        debug!(signature = %ticket.signature, error = %error, "Fetch failed");
        entry.error = Some(error);
        entry.status = EntryStatus::Error;
        entry.invalidated_during_fetch = false;
        inner.notify(&ticket.signature);
        Settlement::Applied {
            status: EntryStatus::Error,
            needs_refetch: false,
        }
    }

    /// Abandon a fetch that was cancelled without a result.
    pub fn cancel_fetch(&self, ticket: &FetchTicket) -> Settlement {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.take_owned(ticket) else {
            return Settlement::Ignored;
        };

        entry.invalidated_during_fetch = false;
        if entry.subscribers.is_empty() {
            inner.entries.remove(&ticket.signature);
            inner.stats.cancelled_fetches += 1;
        } else {
            entry.status = EntryStatus::Stale;
            inner.notify(&ticket.signature);
        }
        Settlement::Applied {
            status: EntryStatus::Stale,
            needs_refetch: false,
        }
    }

    // ========================================================================
    // EVICTION
    // ========================================================================

    /// Remove unused entries whose retention window has elapsed by `now`.
    ///
    /// Returns the removed signatures, sorted.
    pub fn evict_expired(&self, now: Instant) -> Vec<RequestSignature> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let policies = &self.policies;
        let mut evicted = Vec::new();
        inner.entries.retain(|signature, entry| {
            let expired = is_evictable(entry, policies.policy(entry.cache_class), now);
            if expired {
                evicted.push(signature.clone());
            }
            !expired
        });
        if !evicted.is_empty() {
            inner.stats.evictions += evicted.len() as u64;
            debug!(evicted = evicted.len(), "Evicted unused cache entries");
        }
        evicted.sort();
        evicted
    }

    // ========================================================================
    // OPTIMISTIC SUPPORT
    // ========================================================================

    /// Rewrite an entry's value, returning what it looked like before.
    ///
    /// Entries without a value are left alone.
    pub(crate) fn capture_and_rewrite(
        &self,
        signature: &RequestSignature,
        rewrite: &Rewrite,
    ) -> Option<EntrySnapshot> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = inner.entries.get_mut(signature)?;
        let current = entry.value.as_ref()?;

        let snapshot = EntrySnapshot {
            value: current.clone(),
            status: entry.status,
            error: entry.error.clone(),
            last_result_at: entry.last_result_at,
            server_version: entry.server_version,
        };
        let next = rewrite.apply(current);
        entry.value = Some(next);
        if entry.in_flight.is_none() {
            entry.status = EntryStatus::Fresh;
            entry.error = None;
        }
        inner.notify(signature);
        Some(snapshot)
    }

    /// Put a snapshot back unless a server value replaced the entry since.
    pub(crate) fn restore_snapshot(&self, signature: &RequestSignature, snapshot: &EntrySnapshot) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.entries.get_mut(signature) else {
            return false;
        };
        if entry.server_version != snapshot.server_version {
            debug!(signature = %signature, "Skipping restore over newer server value");
            return false;
        }

        entry.value = Some(snapshot.value.clone());
        entry.last_result_at = snapshot.last_result_at;
        entry.error = snapshot.error.clone();
        entry.status = match (entry.in_flight.is_some(), entry.status, snapshot.status) {
            (true, _, _) => EntryStatus::Fetching,
            // Invalidated after the rewrite; keep it stale.
            (false, EntryStatus::Stale, _) => EntryStatus::Stale,
            (false, _, EntryStatus::Fetching) => EntryStatus::Stale,
            (false, _, previous) => previous,
        };
        inner.notify(signature);
        true
    }
}

fn needs_fetch(entry: &CacheEntry, policy: CachePolicy, now: Instant) -> bool {
    match entry.status {
        EntryStatus::Stale | EntryStatus::Error => true,
        EntryStatus::Fetching => false,
        EntryStatus::Fresh => match (policy.max_age(), entry.fetched_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(max_age), Some(at)) => now.saturating_duration_since(at) >= max_age,
        },
    }
}

fn is_evictable(entry: &CacheEntry, policy: CachePolicy, now: Instant) -> bool {
    if !entry.subscribers.is_empty() || entry.in_flight.is_some() {
        return false;
    }
    match (entry.idle_since, policy.keep_unused_for()) {
        (Some(idle), Some(keep)) => now.saturating_duration_since(idle) >= keep,
        _ => false,
    }
}

// ============================================================================
// TESTS
// ============================================================================
