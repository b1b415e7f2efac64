//! Seams to collaborators outside the sync core.

use crate::disposition::Disposition;
use crate::error::RequestFailure;

/// Told about every terminal 401 and 403.
///
/// Typical implementations clear the session and redirect to sign-in. The
/// hook runs on the task that observed the failure and must not block.
pub trait AuthFailureHook: Send + Sync {
    fn on_auth_failure(&self, disposition: Disposition, failure: &RequestFailure);
}

/// Hook that ignores auth failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuthHook;

impl AuthFailureHook for NoopAuthHook {
    fn on_auth_failure(&self, _disposition: Disposition, _failure: &RequestFailure) {}
}
