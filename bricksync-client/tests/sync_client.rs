//! SyncClient scenarios against a scripted transport.

use bricksync_client::{
    CircuitState, EntryStatus, EntryView, MutateOptions, MutationDescriptor, OptimisticRewrite, QueryDescriptor,
    QueryEndpoint, Subscription, SyncClient,
};
use bricksync_core::{CacheClass, CircuitBreakerPolicy, Disposition, Method, Params, RetryPolicy, SyncError, Tag};
use bricksync_test_utils::fixtures::*;
use bricksync_test_utils::{RecordingAuthHook, ScriptedTransport};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn client_for(transport: &Arc<ScriptedTransport>) -> SyncClient {
    SyncClient::builder(transport.clone())
        .retry_policy(fast_retry_policy())
        .build()
}

fn wishlist_query(client: &SyncClient) -> QueryEndpoint {
    client
        .register_query(
            QueryDescriptor::new("getWishlist", WISHLIST_PATH)
                .provides(|_, _| vec![Tag::list("Wishlist")]),
        )
        .unwrap()
}

/// Read events until a fetch has started and then settled.
async fn next_refetch(subscription: &mut Subscription) -> EntryView {
    let mut fetching = false;
    loop {
        let view = subscription.next().await.expect("subscription open");
        if view.status == EntryStatus::Fetching {
            fetching = true;
        } else if fetching && view.status.is_settled() {
            return view;
        }
    }
}

// ============================================================================
// QUERIES
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_subscribers_share_one_request() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_millis(50)));
    transport.respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab());
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);
    let cancel = CancellationToken::new();

    let mut subscriptions: Vec<_> = (0..3)
        .map(|_| client.query(&wishlist, Params::new(), &cancel))
        .collect();

    for subscription in &mut subscriptions {
        let view = subscription.settled().await.unwrap();
        assert_eq!(view.status, EntryStatus::Fresh);
        assert_eq!(view.subscriber_count, 3);
        assert_eq!(item_ids(view.value.as_ref().unwrap()), vec!["A", "B"]);
    }
    assert_eq!(transport.call_count(), 1);
    assert_eq!(client.stats().deduplicated, 2);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_entry_is_served_from_cache() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab());
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);
    let cancel = CancellationToken::new();

    let mut first = client.query(&wishlist, Params::new(), &cancel);
    first.settled().await.unwrap();

    let mut second = client.query(&wishlist, Params::new(), &cancel);
    let view = second.next().await.unwrap();
    assert_eq!(view.status, EntryStatus::Fresh);
    assert_eq!(transport.call_count(), 1);
    assert_eq!(client.stats().hits, 1);
}

#[tokio::test(start_paused = true)]
async fn test_value_as_decodes_the_settled_value() {
    #[derive(serde::Deserialize)]
    struct Wishlist {
        items: Vec<Value>,
    }

    let transport = Arc::new(ScriptedTransport::new());
    transport.respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab());
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);

    let mut subscription = client.query(&wishlist, Params::new(), &CancellationToken::new());
    let decoded: Wishlist = subscription.value_as().await.unwrap();
    assert_eq!(decoded.items.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_path_parameters_shape_the_request() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond_ok(Method::Get, "/api/sets/10497", json!({"id": "10497"}));
    let client = client_for(&transport);
    let set = client
        .register_query(
            QueryDescriptor::new("getSet", "/api/sets/{id}")
                .cache_class(CacheClass::Long)
                .provides(|params, _| vec![Tag::new("Set", params.get_str("id").unwrap_or_default())]),
        )
        .unwrap();

    let params = Params::new().with("id", "10497").with("locale", "en");
    let mut subscription = client.query(&set, params, &CancellationToken::new());
    let view = subscription.settled().await.unwrap();

    assert_eq!(view.value, Some(json!({"id": "10497"})));
    assert!(view.tags.contains(&Tag::new("Set", "10497")));
    let request = &transport.requests()[0];
    assert_eq!(request.query, vec![("locale".to_string(), "en".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_last_subscriber_cancels_fetch_and_removes_entry() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_secs(1)));
    transport.respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab());
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);

    let subscription = client.query(&wishlist, Params::new(), &CancellationToken::new());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.call_count(), 1);

    drop(subscription);
    assert!(client.cached(&wishlist, &Params::new()).is_none());
    assert_eq!(client.stats().cancelled_fetches, 1);

    // The detached call finishes but its result is dropped.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(client.cached(&wishlist, &Params::new()).is_none());
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_token_unsubscribes() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_secs(1)));
    transport.respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab());
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);
    let cancel = CancellationToken::new();

    let mut subscription = client.query(&wishlist, Params::new(), &cancel);
    assert_eq!(subscription.next().await.unwrap().status, EntryStatus::Fetching);

    cancel.cancel();
    assert!(subscription.next().await.is_none());
    assert!(subscription.is_cancelled());
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(client.cached(&wishlist, &Params::new()).is_none());
    assert!(matches!(subscription.settled().await, Err(SyncError::Cancelled)));
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_auth_hook_sees_only_401_and_403() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .respond_status(Method::Get, "/a", 401)
        .respond_status(Method::Get, "/b", 403)
        .respond_status(Method::Get, "/c", 404)
        .respond_status(Method::Get, "/d", 500);
    let hook = Arc::new(RecordingAuthHook::new());
    let client = SyncClient::builder(transport.clone())
        .retry_policy(fast_retry_policy())
        .auth_hook(hook.clone())
        .build();
    let cancel = CancellationToken::new();

    let mut errors = Vec::new();
    for (name, path) in [("getA", "/a"), ("getB", "/b"), ("getC", "/c"), ("getD", "/d")] {
        let endpoint = client.register_query(QueryDescriptor::new(name, path)).unwrap();
        let mut subscription = client.query(&endpoint, Params::new(), &cancel);
        errors.push(subscription.value_as::<Value>().await.unwrap_err());
    }

    assert!(matches!(errors[0], SyncError::AuthRequired(_)));
    assert!(matches!(errors[1], SyncError::Forbidden(_)));
    assert!(matches!(errors[2], SyncError::NotFound(_)));
    assert!(matches!(errors[3], SyncError::Transient(_)));
    assert_eq!(
        hook.calls(),
        vec![
            (Disposition::AuthRequired, "getA".to_string()),
            (Disposition::Forbidden, "getB".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_stop_at_attempt_ceiling() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond_status(Method::Get, WISHLIST_PATH, 503);
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);

    let mut subscription = client.query(&wishlist, Params::new(), &CancellationToken::new());
    let view = subscription.settled().await.unwrap();

    assert_eq!(view.status, EntryStatus::Error);
    let error = view.error.unwrap();
    assert_eq!(error.request_failure().unwrap().attempts, 3);
    assert_eq!(
        error.request_failure().unwrap().report.correlation_id.as_deref(),
        Some("test-503")
    );
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_recovers_on_retry() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .respond_status(Method::Get, WISHLIST_PATH, 503)
        .respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab());
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);

    let mut subscription = client.query(&wishlist, Params::new(), &CancellationToken::new());
    let view = subscription.settled().await.unwrap();

    assert_eq!(view.status, EntryStatus::Fresh);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_query_makes_one_attempt() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond_status(Method::Get, "/api/checkout", 503);
    let client = client_for(&transport);
    let checkout = client
        .register_query(QueryDescriptor::new("getCheckout", "/api/checkout").retryable(false))
        .unwrap();

    let mut subscription = client.query(&checkout, Params::new(), &CancellationToken::new());
    let view = subscription.settled().await.unwrap();

    assert_eq!(view.status, EntryStatus::Error);
    assert_eq!(transport.call_count(), 1);
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_open_circuit_fails_fast_then_recovers() {
    let transport = Arc::new(ScriptedTransport::new());
    for _ in 0..5 {
        transport.respond_status(Method::Get, "/api/gallery", 503);
    }
    transport.respond_ok(Method::Get, "/api/gallery", json!([]));
    let client = SyncClient::builder(transport.clone())
        .retry_policy(RetryPolicy::no_retry())
        .build();
    let gallery = client
        .register_query(QueryDescriptor::new("getGallery", "/api/gallery"))
        .unwrap();
    let cancel = CancellationToken::new();

    for page in 0..5 {
        let mut subscription = client.query(&gallery, Params::new().with("page", page), &cancel);
        let view = subscription.settled().await.unwrap();
        assert!(matches!(view.error, Some(SyncError::Transient(_))));
    }
    assert_eq!(client.circuit_state("getGallery"), CircuitState::Open);

    let mut rejected = client.query(&gallery, Params::new().with("page", 5), &cancel);
    let view = rejected.settled().await.unwrap();
    assert_eq!(view.status, EntryStatus::Error);
    assert!(matches!(view.error, Some(SyncError::CircuitOpen { ref endpoint }) if endpoint == "getGallery"));
    assert_eq!(transport.call_count(), 5);

    let stats = client.retry_stats();
    assert_eq!(stats.total_attempts, 5);
    assert_eq!(stats.failed_attempts, 5);
    assert_eq!(stats.circuit_breaker_trips, 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let mut recovered = client.query(&gallery, Params::new().with("page", 6), &cancel);
    assert_eq!(recovered.settled().await.unwrap().status, EntryStatus::Fresh);
    assert_eq!(client.circuit_state("getGallery"), CircuitState::Closed);
    assert_eq!(client.retry_stats().successful_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_mutation_against_open_circuit_rolls_back_without_sending() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab())
        .respond_status(Method::Post, REORDER_PATH, 500);
    let client = SyncClient::builder(transport.clone())
        .retry_policy(fast_retry_policy())
        .circuit_breaker(CircuitBreakerPolicy {
            failure_threshold: 1,
            ..CircuitBreakerPolicy::default()
        })
        .build();
    let wishlist = wishlist_query(&client);
    let reorder = reorder_mutation(&client);

    let mut subscription = client.query(&wishlist, Params::new(), &CancellationToken::new());
    subscription.settled().await.unwrap();

    let first = client
        .mutate(&reorder, Params::new(), None, reorder_options(&wishlist))
        .await;
    assert!(matches!(first, Err(SyncError::Transient(_))));

    let second = client
        .mutate(&reorder, Params::new(), None, reorder_options(&wishlist))
        .await;
    assert!(matches!(second, Err(SyncError::CircuitOpen { .. })));
    assert_eq!(transport.calls_to(Method::Post, REORDER_PATH), 1);

    let view = client.cached(&wishlist, &Params::new()).unwrap();
    assert_eq!(item_ids(view.value.as_ref().unwrap()), vec!["A", "B"]);
    assert_eq!(client.pending_mutations(), 0);
    assert_eq!(client.circuit_state("getWishlist"), CircuitState::Closed);

    client.reset_circuits();
    assert_eq!(client.circuit_state("reorderWishlist"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_missing_path_parameter_is_an_invalid_request() {
    let transport = Arc::new(ScriptedTransport::new());
    let client = client_for(&transport);
    let set = client
        .register_query(QueryDescriptor::new("getSet", "/api/sets/{id}"))
        .unwrap();

    let mut subscription = client.query(&set, Params::new(), &CancellationToken::new());
    let error = subscription.value_as::<Value>().await.unwrap_err();

    assert!(matches!(error, SyncError::InvalidRequest { .. }));
    assert_eq!(transport.call_count(), 0);
}

// ============================================================================
// INVALIDATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_invalidate_refetches_only_watched_entries() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab())
        .respond_ok(Method::Get, "/api/wishlist/shared", wishlist_ba());
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);
    let shared = client
        .register_query(
            QueryDescriptor::new("getSharedWishlist", "/api/wishlist/shared")
                .provides(|_, _| vec![Tag::list("Wishlist")]),
        )
        .unwrap();
    let cancel = CancellationToken::new();

    let mut watched = client.query(&wishlist, Params::new(), &cancel);
    watched.settled().await.unwrap();
    let mut idle = client.query(&shared, Params::new(), &cancel);
    idle.settled().await.unwrap();
    drop(idle);

    let report = client.invalidate(&[Tag::list("Wishlist")]);
    assert_eq!(report.refetch, vec![wishlist.signature(&Params::new())]);
    assert_eq!(report.marked_stale.len(), 2);

    let view = next_refetch(&mut watched).await;
    assert_eq!(view.status, EntryStatus::Fresh);
    assert_eq!(transport.calls_to(Method::Get, WISHLIST_PATH), 2);
    assert_eq!(transport.calls_to(Method::Get, "/api/wishlist/shared"), 1);
    assert_eq!(
        client.cached(&shared, &Params::new()).unwrap().status,
        EntryStatus::Stale
    );
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_tags_leave_entries_alone() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab());
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);

    let mut subscription = client.query(&wishlist, Params::new(), &CancellationToken::new());
    subscription.settled().await.unwrap();

    let report = client.invalidate(&[Tag::list("Gallery")]);
    assert!(report.is_empty());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.call_count(), 1);
}

// ============================================================================
// MUTATIONS
// ============================================================================

fn reorder_mutation(client: &SyncClient) -> bricksync_client::MutationEndpoint {
    client
        .register_mutation(
            MutationDescriptor::new("reorderWishlist", Method::Post, REORDER_PATH)
                .invalidates(|_, _| vec![Tag::list("Wishlist")]),
        )
        .unwrap()
}

fn reorder_options(wishlist: &QueryEndpoint) -> MutateOptions {
    MutateOptions::new().optimistic(OptimisticRewrite::replace(
        wishlist.signature(&Params::new()),
        wishlist_ba(),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_failed_reorder_reverts_to_server_order() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab())
        .respond_status(Method::Post, REORDER_PATH, 500);
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);
    let reorder = reorder_mutation(&client);

    let mut subscription = client.query(&wishlist, Params::new(), &CancellationToken::new());
    subscription.settled().await.unwrap();

    let result = client
        .mutate(&reorder, Params::new(), Some(json!({"order": ["B", "A"]})), reorder_options(&wishlist))
        .await;
    assert!(matches!(result, Err(SyncError::Transient(_))));

    let optimistic = subscription.next().await.unwrap();
    assert_eq!(item_ids(optimistic.value.as_ref().unwrap()), vec!["B", "A"]);
    let reverted = subscription.next().await.unwrap();
    assert_eq!(item_ids(reverted.value.as_ref().unwrap()), vec!["A", "B"]);
    assert_eq!(reverted.status, EntryStatus::Fresh);

    // Mutations are not retried by default and a failure does not refetch.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.calls_to(Method::Post, REORDER_PATH), 1);
    assert_eq!(transport.calls_to(Method::Get, WISHLIST_PATH), 1);
    assert_eq!(client.pending_mutations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_successful_reorder_keeps_order_and_revalidates() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab())
        .respond_ok(Method::Get, WISHLIST_PATH, wishlist_ba())
        .respond_ok(Method::Post, REORDER_PATH, json!({"success": true}));
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);
    let reorder = reorder_mutation(&client);

    let mut subscription = client.query(&wishlist, Params::new(), &CancellationToken::new());
    subscription.settled().await.unwrap();

    let result = client
        .mutate(&reorder, Params::new(), Some(json!({"order": ["B", "A"]})), reorder_options(&wishlist))
        .await
        .unwrap();
    assert_eq!(result, json!({"success": true}));

    let view = next_refetch(&mut subscription).await;
    assert_eq!(view.status, EntryStatus::Fresh);
    assert_eq!(item_ids(view.value.as_ref().unwrap()), vec!["B", "A"]);
    assert_eq!(transport.calls_to(Method::Get, WISHLIST_PATH), 2);

    let post = transport
        .requests()
        .into_iter()
        .find(|r| r.method == Method::Post)
        .unwrap();
    assert_eq!(post.body, Some(json!({"order": ["B", "A"]})));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_mutation_rolls_back() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_secs(1)));
    transport
        .respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab())
        .respond_ok(Method::Post, REORDER_PATH, json!({"success": true}));
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);
    let reorder = reorder_mutation(&client);

    let mut subscription = client.query(&wishlist, Params::new(), &CancellationToken::new());
    subscription.settled().await.unwrap();

    let cancel = CancellationToken::new();
    let options = reorder_options(&wishlist).cancel(cancel.clone());
    let (result, _) = tokio::join!(
        client.mutate(&reorder, Params::new(), None, options),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        }
    );

    assert!(matches!(result, Err(SyncError::Cancelled)));
    let view = client.cached(&wishlist, &Params::new()).unwrap();
    assert_eq!(item_ids(view.value.as_ref().unwrap()), vec!["A", "B"]);
    assert_eq!(view.status, EntryStatus::Fresh);
    assert_eq!(client.pending_mutations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_mutation_with_missing_path_parameter_never_rewrites() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond_ok(Method::Get, WISHLIST_PATH, wishlist_ab());
    let client = client_for(&transport);
    let wishlist = wishlist_query(&client);
    let remove = client
        .register_mutation(MutationDescriptor::new(
            "removeItem",
            Method::Delete,
            "/api/wishlist/{itemId}",
        ))
        .unwrap();

    let mut subscription = client.query(&wishlist, Params::new(), &CancellationToken::new());
    subscription.settled().await.unwrap();

    let result = client
        .mutate(&remove, Params::new(), None, reorder_options(&wishlist))
        .await;

    assert!(matches!(result, Err(SyncError::InvalidRequest { .. })));
    let view = client.cached(&wishlist, &Params::new()).unwrap();
    assert_eq!(item_ids(view.value.as_ref().unwrap()), vec!["A", "B"]);
}

#[tokio::test]
async fn test_duplicate_endpoint_names_are_rejected() {
    let transport = Arc::new(ScriptedTransport::new());
    let client = client_for(&transport);
    wishlist_query(&client);

    let result = client.register_mutation(MutationDescriptor::new(
        "getWishlist",
        Method::Post,
        WISHLIST_PATH,
    ));
    assert!(matches!(
        result,
        Err(bricksync_client::ClientError::DuplicateEndpoint { .. })
    ));
    assert!(client.query_endpoint("getWishlist").is_some());
    assert!(client.mutation_endpoint("getWishlist").is_none());
}
