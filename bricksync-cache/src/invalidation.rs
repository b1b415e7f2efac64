//! Tag-driven invalidation.
//!
//! A mutation names the tags it affects; every entry carrying an
//! intersecting tag stops being `Fresh`. Watched entries come back as
//! refetch work, unwatched ones wait until someone subscribes.

use bricksync_core::{tags_intersect, RequestSignature, Tag};
use tracing::debug;

use crate::entry::EntryStatus;
use crate::store::CacheStore;

/// What an invalidation touched.
///
/// Signature lists are sorted so reports compare deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Entries with subscribers and no fetch in flight: refetch these now.
    pub refetch: Vec<RequestSignature>,
    /// Entries moved from `Fresh` or `Error` to `Stale` by this call.
    pub marked_stale: Vec<RequestSignature>,
    /// Entries whose in-flight result will land `Stale`.
    pub marked_in_flight: Vec<RequestSignature>,
}

impl InvalidationReport {
    pub fn is_empty(&self) -> bool {
        self.refetch.is_empty() && self.marked_stale.is_empty() && self.marked_in_flight.is_empty()
    }
}

impl CacheStore {
    /// Mark every entry whose tags intersect `tags` as outdated.
    ///
    /// Repeating the same call changes no entry state.
    pub fn invalidate(&self, tags: &[Tag]) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        if tags.is_empty() {
            return report;
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut changed = Vec::new();

        for (signature, entry) in inner.entries.iter_mut() {
            if !tags_intersect(&entry.tags, tags) {
                continue;
            }
            if entry.in_flight.is_some() {
                entry.invalidated_during_fetch = true;
                report.marked_in_flight.push(signature.clone());
                continue;
            }
            if matches!(entry.status, EntryStatus::Fresh | EntryStatus::Error) {
                entry.status = EntryStatus::Stale;
                report.marked_stale.push(signature.clone());
                changed.push(signature.clone());
            }
            if entry.subscriber_count() > 0 {
                report.refetch.push(signature.clone());
            }
        }

        inner.stats.invalidations += report.marked_stale.len() as u64;
        for signature in &changed {
            inner.notify(signature);
        }

        report.refetch.sort();
        report.marked_stale.sort();
        report.marked_in_flight.sort();
        debug!(
            tags = ?tags.iter().map(ToString::to_string).collect::<Vec<_>>(),
            refetch = report.refetch.len(),
            stale = report.marked_stale.len(),
            in_flight = report.marked_in_flight.len(),
            "Invalidated cache entries"
        );
        report
    }
}
