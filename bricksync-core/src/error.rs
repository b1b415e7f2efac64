//! Error types for bricksync operations

use crate::disposition::Disposition;
use crate::report::ErrorReport;
use crate::response::{Failure, FailureStatus};
use crate::MutationId;
use serde_json::Value;
use thiserror::Error;

/// A request that ended in a terminal failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFailure {
    /// Endpoint name the request was issued for.
    pub endpoint: String,
    pub status: FailureStatus,
    /// Raw body so callers can log what the server said.
    pub body: Value,
    /// Attempts made, including retries.
    pub attempts: u32,
    pub report: ErrorReport,
}

/// Optimistic mutation bookkeeping errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("Unknown mutation: {id}")]
    UnknownMutation { id: MutationId },

    #[error("Mutation already pending: {id}")]
    DuplicateMutation { id: MutationId },
}

/// Master error type for all bricksync errors.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Authentication required for {}", .0.endpoint)]
    AuthRequired(Box<RequestFailure>),

    #[error("Access to {} is forbidden", .0.endpoint)]
    Forbidden(Box<RequestFailure>),

    #[error("{} returned not found", .0.endpoint)]
    NotFound(Box<RequestFailure>),

    #[error("{} kept failing with status {} after {} attempts", .0.endpoint, .0.status, .0.attempts)]
    Transient(Box<RequestFailure>),

    #[error("{} failed with status {}: {}", .0.endpoint, .0.status, .0.body)]
    Fatal(Box<RequestFailure>),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Circuit open for {endpoint}, request not sent")]
    CircuitOpen { endpoint: String },

    #[error("Invalid request for {endpoint}: {reason}")]
    InvalidRequest { endpoint: String, reason: String },

    #[error("Failed to decode cached value: {0}")]
    Decode(String),

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),
}

impl SyncError {
    /// Build the surfaced error for a classified terminal failure.
    pub fn from_failure(
        endpoint: impl Into<String>,
        failure: Failure,
        disposition: Disposition,
        attempts: u32,
    ) -> Self {
        let report = ErrorReport::from_failure(&failure, disposition);
        let failure = Box::new(RequestFailure {
            endpoint: endpoint.into(),
            status: failure.status,
            body: failure.body,
            attempts,
            report,
        });
        match disposition {
            Disposition::AuthRequired => SyncError::AuthRequired(failure),
            Disposition::Forbidden => SyncError::Forbidden(failure),
            Disposition::NotFound => SyncError::NotFound(failure),
            Disposition::Transient => SyncError::Transient(failure),
            Disposition::Fatal => SyncError::Fatal(failure),
        }
    }

    /// Disposition of a request failure, `None` for other errors.
    pub fn disposition(&self) -> Option<Disposition> {
        match self {
            SyncError::AuthRequired(_) => Some(Disposition::AuthRequired),
            SyncError::Forbidden(_) => Some(Disposition::Forbidden),
            SyncError::NotFound(_) => Some(Disposition::NotFound),
            SyncError::Transient(_) => Some(Disposition::Transient),
            SyncError::Fatal(_) => Some(Disposition::Fatal),
            _ => None,
        }
    }

    pub fn request_failure(&self) -> Option<&RequestFailure> {
        match self {
            SyncError::AuthRequired(f)
            | SyncError::Forbidden(f)
            | SyncError::NotFound(f)
            | SyncError::Transient(f)
            | SyncError::Fatal(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

/// Result type alias for bricksync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_failure_maps_disposition() {
        let err = SyncError::from_failure(
            "getWishlist",
            Failure::http(404, json!({"error": {"code": "NOT_FOUND", "message": "gone"}})),
            Disposition::NotFound,
            1,
        );
        assert!(matches!(err, SyncError::NotFound(_)));
        assert_eq!(err.disposition(), Some(Disposition::NotFound));
        let failure = err.request_failure().expect("request failure");
        assert_eq!(failure.endpoint, "getWishlist");
        assert_eq!(failure.report.message, "gone");
    }

    #[test]
    fn test_transient_display_mentions_attempts() {
        let err = SyncError::from_failure(
            "getGallery",
            Failure::http(503, Value::Null),
            Disposition::Transient,
            3,
        );
        let msg = format!("{}", err);
        assert!(msg.contains("getGallery"));
        assert!(msg.contains("503"));
        assert!(msg.contains("3 attempts"));
    }

    #[test]
    fn test_fatal_keeps_raw_body() {
        let err = SyncError::from_failure(
            "reorderWishlist",
            Failure::http(409, json!({"error": {"code": "CONFLICT"}})),
            Disposition::Fatal,
            1,
        );
        let failure = err.request_failure().expect("request failure");
        assert_eq!(failure.body, json!({"error": {"code": "CONFLICT"}}));
        assert!(format!("{}", err).contains("409"));
    }

    #[test]
    fn test_non_request_errors_have_no_disposition() {
        assert_eq!(SyncError::Cancelled.disposition(), None);
        assert!(SyncError::Cancelled.is_cancelled());
        let mutation = SyncError::from(MutationError::UnknownMutation {
            id: MutationId::new(),
        });
        assert!(matches!(mutation, SyncError::Mutation(_)));
        assert!(mutation.request_failure().is_none());

        let invalid = SyncError::InvalidRequest {
            endpoint: "getWishlistItem".to_string(),
            reason: "missing path parameter 'id'".to_string(),
        };
        assert_eq!(invalid.disposition(), None);
        assert!(invalid.to_string().contains("'id'"));

        let open = SyncError::CircuitOpen {
            endpoint: "getGallery".to_string(),
        };
        assert_eq!(open.disposition(), None);
        assert!(open.to_string().contains("getGallery"));
    }
}
