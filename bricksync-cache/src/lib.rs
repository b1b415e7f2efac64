//! Bricksync Cache
//!
//! The shared result cache and the two components that rewrite it:
//!
//! - [`store`]: entries keyed by [`RequestSignature`], subscriber counts,
//!   in-flight de-duplication, ordered notifications and eviction
//! - [`invalidation`]: tag-driven `Fresh -> Stale` transitions
//! - [`optimistic`]: reversible local rewrites for pending mutations
//! - [`janitor`]: background eviction sweep
//!
//! All state lives behind one mutex that is never held across an `.await`,
//! so each operation below is a single atomic step.
//!
//! [`RequestSignature`]: bricksync_core::RequestSignature

pub mod entry;
pub mod invalidation;
pub mod janitor;
pub mod optimistic;
pub mod stats;
pub mod store;

pub use entry::{EntryStatus, EntryView};
pub use invalidation::InvalidationReport;
pub use janitor::spawn_janitor;
pub use optimistic::{EntrySnapshot, OptimisticApplier, OptimisticRewrite, PendingMutation, Rewrite};
pub use stats::CacheStats;
pub use store::{CacheStore, FetchDecision, FetchId, FetchTicket, Settlement, SubscriberId, Subscribed};
