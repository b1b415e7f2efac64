//! Transport adapter.
//!
//! One `execute` call is one network call. The adapter decorates the request
//! with standard headers and races the call against the caller's
//! cancellation token. A cancelled call is not aborted: it keeps running on
//! its own task and its result is dropped.

use async_trait::async_trait;
use bricksync_core::{Cancelled, Failure, Method, RequestSignature, Response};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Header carrying the anti-forgery token on state-changing requests.
pub const ANTI_FORGERY_HEADER: &str = "X-CSRF-Token";

// ============================================================================
// REQUESTS
// ============================================================================

/// What to send, before any headers are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    /// Path relative to the transport's base URL, already expanded.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A request with its headers, as handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
}

impl PreparedRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

// ============================================================================
// SEAMS
// ============================================================================

/// Performs a single network call.
///
/// Implementations never fail out of band: HTTP error statuses and
/// connectivity problems are both reported as [`Response::Failed`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: PreparedRequest) -> Response;
}

/// Supplies the anti-forgery token for unsafe methods.
pub trait AntiForgeryTokenSource: Send + Sync {
    /// Current token, or `None` when no token has been issued yet.
    fn token(&self) -> Option<String>;
}

/// Token source that always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenSource(String);

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl AntiForgeryTokenSource for StaticTokenSource {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

// ============================================================================
// ADAPTER
// ============================================================================

#[derive(Clone)]
pub struct TransportAdapter {
    transport: Arc<dyn Transport>,
    anti_forgery: Option<Arc<dyn AntiForgeryTokenSource>>,
}

impl TransportAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            anti_forgery: None,
        }
    }

    pub fn with_anti_forgery(mut self, source: Arc<dyn AntiForgeryTokenSource>) -> Self {
        self.anti_forgery = Some(source);
        self
    }

    /// Attach the standard headers.
    pub fn prepare(&self, spec: &RequestSpec) -> PreparedRequest {
        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        if spec.method.is_unsafe() {
            if let Some(token) = self.anti_forgery.as_ref().and_then(|source| source.token()) {
                headers.push((ANTI_FORGERY_HEADER.to_string(), token));
            }
        }
        PreparedRequest {
            method: spec.method,
            path: spec.path.clone(),
            query: spec.query.clone(),
            body: spec.body.clone(),
            headers,
        }
    }

    /// Perform exactly one network call for `signature`.
    ///
    /// Returns `Err(Cancelled)` as soon as `cancel` fires. A token that is
    /// already cancelled skips the call entirely.
    pub async fn execute(
        &self,
        signature: &RequestSignature,
        spec: &RequestSpec,
        cancel: &CancellationToken,
    ) -> Result<Response, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let request = self.prepare(spec);
        debug!(
            signature = %signature,
            method = %request.method,
            path = %request.path,
            "Sending request"
        );

        let transport = Arc::clone(&self.transport);
        let call = tokio::spawn(async move { transport.send(request).await });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(signature = %signature, "Request cancelled, detaching call");
                Err(Cancelled)
            }
            joined = call => match joined {
                Ok(response) => Ok(response),
                Err(err) => Ok(Response::Failed(Failure::network(format!(
                    "transport task failed: {}",
                    err
                )))),
            },
        }
    }
}
