//! Optimistic mutations.
//!
//! A mutation rewrites cached values before the server answers and keeps a
//! snapshot of each entry it touched. Commit drops the snapshot and
//! invalidates the mutation's tags; rollback puts the snapshot back.
//!
//! Pending mutations form a stack. A later mutation snapshots the state
//! left by earlier ones, so rolling back an older mutation hands its
//! snapshot of a shared entry to the next newer mutation instead of
//! overwriting that mutation's rewrite.

use bricksync_core::{MutationError, MutationId, RequestSignature, SyncError, Tag, Timestamp};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::entry::EntryStatus;
use crate::invalidation::InvalidationReport;
use crate::store::CacheStore;

// ============================================================================
// REWRITES
// ============================================================================

/// New value for a cached entry.
#[derive(Clone)]
pub enum Rewrite {
    Replace(Value),
    /// Pure function of the current value.
    Update(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

impl Rewrite {
    pub fn replace(value: Value) -> Self {
        Rewrite::Replace(value)
    }

    pub fn update<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Rewrite::Update(Arc::new(f))
    }

    pub(crate) fn apply(&self, current: &Value) -> Value {
        match self {
            Rewrite::Replace(value) => value.clone(),
            Rewrite::Update(f) => f(current),
        }
    }
}

impl fmt::Debug for Rewrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rewrite::Replace(value) => f.debug_tuple("Replace").field(value).finish(),
            Rewrite::Update(_) => f.write_str("Update(<fn>)"),
        }
    }
}

/// A rewrite aimed at one cached query.
#[derive(Debug, Clone)]
pub struct OptimisticRewrite {
    pub signature: RequestSignature,
    pub rewrite: Rewrite,
}

impl OptimisticRewrite {
    pub fn replace(signature: RequestSignature, value: Value) -> Self {
        Self {
            signature,
            rewrite: Rewrite::replace(value),
        }
    }

    pub fn update<F>(signature: RequestSignature, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self {
            signature,
            rewrite: Rewrite::update(f),
        }
    }
}

// ============================================================================
// PENDING MUTATIONS
// ============================================================================

/// Entry state captured before a rewrite.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub value: Value,
    pub status: EntryStatus,
    pub error: Option<SyncError>,
    pub last_result_at: Option<Timestamp>,
    /// Server version at capture time; restore is skipped once it moves.
    pub server_version: u64,
}

#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub id: MutationId,
    /// Signatures actually rewritten, in rewrite order.
    pub affected: Vec<RequestSignature>,
    pub snapshot: BTreeMap<RequestSignature, EntrySnapshot>,
    pub invalidates_tags: Vec<Tag>,
}

/// Applies, commits and rolls back optimistic mutations against a store.
pub struct OptimisticApplier {
    store: Arc<CacheStore>,
    /// Oldest first.
    pending: Mutex<Vec<PendingMutation>>,
}

impl OptimisticApplier {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingMutation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pending(&self, id: MutationId) -> bool {
        self.lock().iter().any(|m| m.id == id)
    }

    /// Apply `rewrites` and remember how to undo them.
    ///
    /// Entries without a cached value are skipped and not snapshotted.
    pub fn begin(
        &self,
        id: MutationId,
        rewrites: Vec<OptimisticRewrite>,
        invalidates_tags: Vec<Tag>,
    ) -> Result<PendingMutation, MutationError> {
        let mut pending = self.lock();
        if pending.iter().any(|m| m.id == id) {
            return Err(MutationError::DuplicateMutation { id });
        }

        let mut snapshot = BTreeMap::new();
        let mut affected = Vec::new();
        for OptimisticRewrite { signature, rewrite } in rewrites {
            let Some(before) = self.store.capture_and_rewrite(&signature, &rewrite) else {
                debug!(mutation = %id, signature = %signature, "No cached value to rewrite");
                continue;
            };
            // A second rewrite of the same entry keeps the first snapshot.
            if !snapshot.contains_key(&signature) {
                snapshot.insert(signature.clone(), before);
                affected.push(signature);
            }
        }

        let mutation = PendingMutation {
            id,
            affected,
            snapshot,
            invalidates_tags,
        };
        debug!(mutation = %id, affected = mutation.affected.len(), "Optimistic mutation applied");
        pending.push(mutation.clone());
        Ok(mutation)
    }

    /// The server accepted the mutation: forget the snapshot and invalidate.
    pub fn commit(&self, id: MutationId) -> Result<InvalidationReport, MutationError> {
        let mutation = {
            let mut pending = self.lock();
            let position = pending
                .iter()
                .position(|m| m.id == id)
                .ok_or(MutationError::UnknownMutation { id })?;
            pending.remove(position)
        };
        debug!(mutation = %id, "Optimistic mutation committed");
        Ok(self.store.invalidate(&mutation.invalidates_tags))
    }

    /// The server rejected the mutation: undo its rewrites.
    ///
    /// Returns the signatures whose snapshot was written back to the store.
    pub fn rollback(&self, id: MutationId) -> Result<Vec<RequestSignature>, MutationError> {
        let mut pending = self.lock();
        let position = pending
            .iter()
            .position(|m| m.id == id)
            .ok_or(MutationError::UnknownMutation { id })?;
        let mutation = pending.remove(position);

        let mut restored = Vec::new();
        for (signature, before) in mutation.snapshot {
            // Everything from `position` on is newer than the removed mutation.
            let newer = pending[position..]
                .iter_mut()
                .find_map(|m| m.snapshot.get_mut(&signature));
            if let Some(slot) = newer {
                if slot.server_version == before.server_version {
                    *slot = before;
                }
                continue;
            }
            if self.store.restore_snapshot(&signature, &before) {
                restored.push(signature);
            }
        }

        debug!(mutation = %id, restored = restored.len(), "Optimistic mutation rolled back");
        Ok(restored)
    }
}
