//! Caller-facing error reports.
//!
//! Servers answer failures with `{"error": {"code", "message", "details"},
//! "correlationId"}` (older endpoints use `type` instead of `code`). The
//! report keeps what a caller needs to react and what support needs to
//! trace the request.

use crate::disposition::Disposition;
use crate::response::{Failure, FailureStatus};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// What the caller should offer the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorAction {
    Retry,
    Login,
    NavigateAway,
    FixInput,
    Wait,
    ContactSupport,
}

/// Parsed view of a failure body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    pub correlation_id: Option<String>,
    pub details: Option<Value>,
    pub action: ErrorAction,
    pub retry_after_hint: Option<Duration>,
}

impl ErrorReport {
    pub fn from_failure(failure: &Failure, disposition: Disposition) -> Self {
        let error = failure.body.get("error");
        let code = error
            .and_then(|e| e.get("code").or_else(|| e.get("type")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default_code(failure.status, disposition).to_string());
        let message = error
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .or_else(|| failure.body.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| default_message(disposition).to_string());
        let correlation_id = failure
            .body
            .get("correlationId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let details = error.and_then(|e| e.get("details")).cloned();

        Self {
            code,
            message,
            correlation_id,
            details,
            action: action_for(failure.status, disposition),
            retry_after_hint: failure.retry_after,
        }
    }
}

fn action_for(status: FailureStatus, disposition: Disposition) -> ErrorAction {
    match disposition {
        Disposition::AuthRequired => ErrorAction::Login,
        Disposition::Forbidden | Disposition::NotFound => ErrorAction::NavigateAway,
        Disposition::Transient if status == FailureStatus::Http(429) => ErrorAction::Wait,
        Disposition::Transient => ErrorAction::Retry,
        Disposition::Fatal => match status {
            FailureStatus::Http(400) | FailureStatus::Http(409) | FailureStatus::Http(422) => {
                ErrorAction::FixInput
            }
            _ => ErrorAction::ContactSupport,
        },
    }
}

fn default_code(status: FailureStatus, disposition: Disposition) -> &'static str {
    match (status, disposition) {
        (FailureStatus::NetworkError, _) => "NETWORK_ERROR",
        (FailureStatus::Http(429), _) => "TOO_MANY_REQUESTS",
        (_, Disposition::AuthRequired) => "UNAUTHORIZED",
        (_, Disposition::Forbidden) => "FORBIDDEN",
        (_, Disposition::NotFound) => "NOT_FOUND",
        (_, Disposition::Transient) => "SERVICE_UNAVAILABLE",
        (_, Disposition::Fatal) => "INTERNAL_ERROR",
    }
}

fn default_message(disposition: Disposition) -> &'static str {
    match disposition {
        Disposition::AuthRequired => "Please sign in to continue.",
        Disposition::Forbidden => "You don't have permission to access this resource.",
        Disposition::NotFound => "The requested resource could not be found.",
        Disposition::Transient => "The service is temporarily unavailable.",
        Disposition::Fatal => "An unexpected error occurred.",
    }
}
