//! Bricksync Test Utilities
//!
//! Shared test infrastructure for the bricksync workspace:
//! - A scripted [`Transport`] that counts and records calls
//! - A recording auth-failure hook
//! - Proptest generators for tags, parameters and signatures
//! - Fixtures for the wishlist scenarios used across crates

pub use bricksync_core::{
    AuthFailureHook, Disposition, Failure, Method, Params, RequestFailure, RequestSignature,
    Response, RetryPolicy, Tag, TagSet,
};
pub use bricksync_transport::{PreparedRequest, Transport};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// SCRIPTED TRANSPORT
// ============================================================================

fn route_key(method: Method, path: &str) -> String {
    format!("{} {}", method, path)
}

/// Transport that replays scripted responses per `METHOD path`.
///
/// Each route holds a queue; the last queued response repeats forever.
/// Unscripted routes answer 404.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Response>>>,
    requests: Mutex<Vec<PreparedRequest>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call take `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue `response` for `method path`.
    pub fn respond(&self, method: Method, path: &str, response: Response) -> &Self {
        lock(&self.routes)
            .entry(route_key(method, path))
            .or_default()
            .push_back(response);
        self
    }

    /// Queue a success with `value`.
    pub fn respond_ok(&self, method: Method, path: &str, value: Value) -> &Self {
        self.respond(method, path, Response::Ok(value))
    }

    /// Queue a failure with `status` and a standard error body.
    pub fn respond_status(&self, method: Method, path: &str, status: u16) -> &Self {
        self.respond(method, path, Response::Failed(error_failure(status)))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, method: Method, path: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    pub fn requests(&self) -> Vec<PreparedRequest> {
        lock(&self.requests).clone()
    }

    fn next_response(&self, method: Method, path: &str) -> Response {
        let mut routes = lock(&self.routes);
        match routes.get_mut(&route_key(method, path)) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(not_scripted),
            Some(queue) => queue.front().cloned().unwrap_or_else(not_scripted),
            None => not_scripted(),
        }
    }
}

fn not_scripted() -> Response {
    Response::Failed(Failure::http(
        404,
        json!({"error": {"code": "NOT_FOUND", "message": "no scripted response"}}),
    ))
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: PreparedRequest) -> Response {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self.next_response(request.method, &request.path);
        lock(&self.requests).push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        response
    }
}

/// Failure with the standard `{error: {code, message}}` body.
pub fn error_failure(status: u16) -> Failure {
    let code = match status {
        401 => "UNAUTHORIZED",
        403 => "FORBIDDEN",
        404 => "NOT_FOUND",
        409 => "CONFLICT",
        429 => "TOO_MANY_REQUESTS",
        500..=599 => "SERVICE_UNAVAILABLE",
        _ => "BAD_REQUEST",
    };
    Failure::http(
        status,
        json!({
            "success": false,
            "error": {"code": code, "message": format!("scripted {}", status)},
            "correlationId": format!("test-{}", status)
        }),
    )
}

// ============================================================================
// RECORDING AUTH HOOK
// ============================================================================

/// Auth hook that remembers every call.
#[derive(Debug, Default)]
pub struct RecordingAuthHook {
    calls: Mutex<Vec<(Disposition, String)>>,
}

impl RecordingAuthHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(disposition, endpoint)` pairs in call order.
    pub fn calls(&self) -> Vec<(Disposition, String)> {
        lock(&self.calls).clone()
    }
}

impl AuthFailureHook for RecordingAuthHook {
    fn on_auth_failure(&self, disposition: Disposition, failure: &RequestFailure) {
        lock(&self.calls).push((disposition, failure.endpoint.clone()));
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for bricksync types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_kind() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["Wishlist", "WishlistItem", "Gallery", "Set"]).prop_map(str::to_string)
    }

    /// Tags over a small id space so intersections actually happen.
    pub fn arb_tag() -> impl Strategy<Value = Tag> {
        (arb_kind(), prop::sample::select(vec!["LIST", "a", "b", "*"]))
            .prop_map(|(kind, id)| Tag::new(kind, id))
    }

    pub fn arb_tag_set() -> impl Strategy<Value = TagSet> {
        prop::collection::btree_set(arb_tag(), 0..4)
    }

    /// JSON scalars, including null.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::from),
        ]
    }

    /// Parameter maps as `(key, value)` pairs in arbitrary order.
    pub fn arb_param_pairs() -> impl Strategy<Value = Vec<(String, Value)>> {
        prop::collection::vec(("[a-z]{1,6}", arb_scalar()), 0..6)
    }

    pub fn arb_signature() -> impl Strategy<Value = RequestSignature> {
        (prop::sample::select(vec!["getWishlist", "getGallery"]), arb_param_pairs()).prop_map(
            |(endpoint, pairs)| {
                let mut params = Params::new();
                for (key, value) in pairs {
                    params.insert(key, value);
                }
                RequestSignature::new(endpoint, &params)
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Wishlist data shared by scenario tests.

    use super::*;

    pub const WISHLIST_PATH: &str = "/api/wishlist";
    pub const REORDER_PATH: &str = "/api/wishlist/reorder";

    pub fn wishlist_item(id: &str, title: &str) -> Value {
        json!({"id": id, "title": title})
    }

    /// Items `A` then `B`.
    pub fn wishlist_ab() -> Value {
        json!({"items": [wishlist_item("A", "Castle"), wishlist_item("B", "Rocket")]})
    }

    /// Items `B` then `A`.
    pub fn wishlist_ba() -> Value {
        json!({"items": [wishlist_item("B", "Rocket"), wishlist_item("A", "Castle")]})
    }

    /// Ids of the items in a wishlist value, in order.
    pub fn item_ids(value: &Value) -> Vec<String> {
        value["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Three attempts, 100ms then 200ms apart, no jitter.
    pub fn fast_retry_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use bricksync_transport::{RequestSpec, TransportAdapter};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_last_scripted_response_repeats() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond_status(Method::Get, WISHLIST_PATH, 503)
            .respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab());
        let adapter = TransportAdapter::new(transport.clone());
        let cancel = CancellationToken::new();
        let signature = RequestSignature::bare("getWishlist");
        let spec = RequestSpec::get(WISHLIST_PATH);

        let first = adapter.execute(&signature, &spec, &cancel).await.unwrap();
        let second = adapter.execute(&signature, &spec, &cancel).await.unwrap();
        let third = adapter.execute(&signature, &spec, &cancel).await.unwrap();

        assert!(!first.is_ok());
        assert_eq!(second, Response::Ok(wishlist_ab()));
        assert_eq!(third, Response::Ok(wishlist_ab()));
        assert_eq!(transport.call_count(), 3);
        assert_eq!(transport.calls_to(Method::Get, WISHLIST_PATH), 3);
    }

    #[tokio::test]
    async fn test_unscripted_route_is_not_found() {
        let transport = ScriptedTransport::new();
        let response = transport
            .send(PreparedRequest {
                method: Method::Delete,
                path: "/nowhere".to_string(),
                query: vec![],
                body: None,
                headers: vec![],
            })
            .await;
        assert_eq!(response.failure().and_then(|f| f.status.code()), Some(404));
    }

    #[test]
    fn test_item_ids() {
        assert_eq!(item_ids(&wishlist_ab()), vec!["A", "B"]);
        assert_eq!(item_ids(&wishlist_ba()), vec!["B", "A"]);
        assert!(item_ids(&Value::Null).is_empty());
    }
}
