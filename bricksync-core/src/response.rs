//! Uniform result shape produced by the transport.

use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Status of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStatus {
    /// The server answered with this HTTP status.
    Http(u16),
    /// No usable answer: connect failure, timeout, reset.
    NetworkError,
}

impl FailureStatus {
    pub fn code(&self) -> Option<u16> {
        match self {
            FailureStatus::Http(code) => Some(*code),
            FailureStatus::NetworkError => None,
        }
    }
}

impl fmt::Display for FailureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStatus::Http(code) => write!(f, "{}", code),
            FailureStatus::NetworkError => f.write_str("NETWORK_ERROR"),
        }
    }
}

/// A request that did not produce a usable value.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub status: FailureStatus,
    /// Raw response body, or a string describing a network error.
    pub body: Value,
    /// Parsed `Retry-After`, when the server sent one.
    pub retry_after: Option<Duration>,
}

impl Failure {
    pub fn http(status: u16, body: Value) -> Self {
        Self {
            status: FailureStatus::Http(status),
            body,
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: FailureStatus::NetworkError,
            body: Value::String(message.into()),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Outcome of exactly one network call.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok(Value),
    Failed(Failure),
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Response::Ok(_) => None,
            Response::Failed(failure) => Some(failure),
        }
    }

    pub fn into_result(self) -> Result<Value, Failure> {
        match self {
            Response::Ok(value) => Ok(value),
            Response::Failed(failure) => Err(failure),
        }
    }
}

impl From<Failure> for Response {
    fn from(failure: Failure) -> Self {
        Response::Failed(failure)
    }
}

/// The caller gave up on the request before it resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request cancelled")]
pub struct Cancelled;
