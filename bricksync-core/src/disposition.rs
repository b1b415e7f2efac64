//! Failure classification.
//!
//! Maps a failed result onto the retry-relevant disposition. This table is
//! the single source of truth for what gets retried: transient statuses are
//! recovered by the retry scheduler, everything else surfaces after one try.

use crate::response::{Failure, FailureStatus};
use std::fmt;

/// Retry-relevant category of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// 401: credentials missing or expired.
    AuthRequired,
    /// 403: authenticated but not allowed.
    Forbidden,
    /// 404: the resource does not exist.
    NotFound,
    /// 408, 429, 5xx or no connectivity.
    Transient,
    /// Anything unrecognised.
    Fatal,
}

impl Disposition {
    /// Only transient failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Disposition::Transient)
    }

    /// Whether the external auth-failure hook must be told.
    pub fn notifies_auth_hook(&self) -> bool {
        matches!(self, Disposition::AuthRequired | Disposition::Forbidden)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::AuthRequired => "auth-required",
            Disposition::Forbidden => "forbidden",
            Disposition::NotFound => "not-found",
            Disposition::Transient => "transient",
            Disposition::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a status alone.
pub fn classify_status(status: FailureStatus) -> Disposition {
    match status {
        FailureStatus::NetworkError => Disposition::Transient,
        FailureStatus::Http(401) => Disposition::AuthRequired,
        FailureStatus::Http(403) => Disposition::Forbidden,
        FailureStatus::Http(404) => Disposition::NotFound,
        FailureStatus::Http(408) | FailureStatus::Http(429) => Disposition::Transient,
        FailureStatus::Http(500..=599) => Disposition::Transient,
        FailureStatus::Http(_) => Disposition::Fatal,
    }
}

/// Classify a failed result. Deterministic, no side effects.
pub fn classify(failure: &Failure) -> Disposition {
    classify_status(failure.status)
}
