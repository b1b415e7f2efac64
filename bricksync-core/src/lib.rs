//! Bricksync Core - Shared Types
//!
//! Data types and pure policy shared by every other bricksync crate:
//! request signatures, invalidation tags, transport result shapes, the
//! failure classifier and the retry/cache policies. No I/O lives here.

pub mod disposition;
pub mod error;
pub mod hooks;
pub mod policy;
pub mod report;
pub mod response;
pub mod signature;
pub mod tag;

pub use disposition::{classify, classify_status, Disposition};
pub use error::{MutationError, RequestFailure, SyncError, SyncResult};
pub use hooks::{AuthFailureHook, NoopAuthHook};
pub use policy::{millis, CacheClass, CachePolicy, CachePolicyTable, CircuitBreakerPolicy, RetryPolicy};
pub use report::{ErrorAction, ErrorReport};
pub use response::{Cancelled, Failure, FailureStatus, Response};
pub use signature::{Params, RequestSignature};
pub use tag::{tags_intersect, Tag, TagId, TagSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier of an optimistic mutation.
///
/// UUIDv7 so pending mutations sort by creation time in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationId(Uuid);

impl MutationId {
    /// Generate a new timestamp-sortable mutation id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// HTTP METHOD
// ============================================================================

/// HTTP verb of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Unsafe methods change server state and carry the anti-forgery token.
    pub fn is_unsafe(&self) -> bool {
        !matches!(self, Method::Get)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
