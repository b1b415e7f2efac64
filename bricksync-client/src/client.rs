//! The sync client: queries, mutations and the fetch driver.

use bricksync_cache::{
    spawn_janitor, CacheStats, CacheStore, EntryView, FetchDecision, FetchTicket, InvalidationReport,
    OptimisticApplier, OptimisticRewrite, Settlement,
};
use bricksync_core::{
    classify, millis, AuthFailureHook, CachePolicyTable, CircuitBreakerPolicy, Disposition, Failure,
    MutationId, NoopAuthHook, Params, RequestSignature, Response, RetryPolicy, SyncError, SyncResult,
    Tag,
};
use bricksync_transport::{
    run_guarded, AntiForgeryTokenSource, AttemptGuard, CircuitBreakers, CircuitState, HttpTransport,
    RequestSpec, RetryMetrics, RetryOutcome, RetryStats, Transport, TransportAdapter,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::endpoint::{
    EndpointRegistry, MutationDescriptor, MutationEndpoint, QueryDescriptor, QueryEndpoint,
};
use crate::error::{ClientError, ClientResult};
use crate::subscription::Subscription;

// ============================================================================
// OPTIONS
// ============================================================================

/// Per-call options for [`SyncClient::mutate`].
#[derive(Debug, Clone, Default)]
pub struct MutateOptions {
    /// Cache rewrites applied before the request and undone if it fails.
    pub optimistic: Vec<OptimisticRewrite>,
    pub cancel: Option<CancellationToken>,
}

impl MutateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimistic(mut self, rewrite: OptimisticRewrite) -> Self {
        self.optimistic.push(rewrite);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct SyncClientBuilder {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    circuit_breaker: CircuitBreakerPolicy,
    cache: CachePolicyTable,
    auth_hook: Arc<dyn AuthFailureHook>,
    anti_forgery: Option<Arc<dyn AntiForgeryTokenSource>>,
    janitor_interval: Option<Duration>,
}

impl SyncClientBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerPolicy::default(),
            cache: CachePolicyTable::default(),
            auth_hook: Arc::new(NoopAuthHook),
            anti_forgery: None,
            janitor_interval: None,
        }
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn circuit_breaker(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = policy;
        self
    }

    /// Sweep expired cache entries every `interval` for the client's lifetime.
    ///
    /// The sweep needs a tokio runtime at [`build`](Self::build) time.
    pub fn janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = Some(interval);
        self
    }

    pub fn cache_policies(mut self, cache: CachePolicyTable) -> Self {
        self.cache = cache;
        self
    }

    pub fn auth_hook(mut self, hook: Arc<dyn AuthFailureHook>) -> Self {
        self.auth_hook = hook;
        self
    }

    pub fn anti_forgery(mut self, source: Arc<dyn AntiForgeryTokenSource>) -> Self {
        self.anti_forgery = Some(source);
        self
    }

    pub fn build(self) -> SyncClient {
        let store = Arc::new(CacheStore::new(self.cache));
        let mut adapter = TransportAdapter::new(self.transport);
        if let Some(source) = self.anti_forgery {
            adapter = adapter.with_anti_forgery(source);
        }
        let inner = Arc::new(ClientInner {
            applier: OptimisticApplier::new(Arc::clone(&store)),
            store,
            adapter,
            retry: self.retry,
            breakers: CircuitBreakers::new(self.circuit_breaker),
            retry_metrics: RetryMetrics::new(),
            auth_hook: self.auth_hook,
            registry: Mutex::new(EndpointRegistry::new()),
            origins: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        if let Some(interval) = self.janitor_interval {
            if Handle::try_current().is_ok() {
                ClientInner::start_janitor(&inner, interval, inner.shutdown.child_token());
            } else {
                warn!("No tokio runtime, cache janitor not started");
            }
        }
        SyncClient { inner }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

struct ClientInner {
    store: Arc<CacheStore>,
    applier: OptimisticApplier,
    adapter: TransportAdapter,
    retry: RetryPolicy,
    breakers: CircuitBreakers,
    retry_metrics: RetryMetrics,
    auth_hook: Arc<dyn AuthFailureHook>,
    registry: Mutex<EndpointRegistry>,
    /// How to refetch each signature a query created. Locked before the
    /// store; an entry lives exactly as long as the store keeps the signature.
    origins: Mutex<HashMap<RequestSignature, (QueryEndpoint, Params)>>,
    /// Stops background work started by the builder.
    shutdown: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Entry point for every feature's data layer.
///
/// Cheap to clone; clones share one cache. Methods that start fetches
/// spawn tokio tasks and must run inside a runtime.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncClient {
    pub fn builder(transport: Arc<dyn Transport>) -> SyncClientBuilder {
        SyncClientBuilder::new(transport)
    }

    /// Build an HTTP-backed client from validated configuration.
    ///
    /// Must be called inside a tokio runtime: the cache janitor starts here
    /// and runs until the last clone of the client is dropped.
    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        Handle::try_current().map_err(|err| ClientError::Runtime(err.to_string()))?;
        let transport = HttpTransport::new(&config.transport_config())?;
        info!(
            base_url = %transport.base_url(),
            janitor_interval_ms = config.janitor_interval_ms,
            "Sync client configured"
        );
        Ok(Self::builder(Arc::new(transport))
            .retry_policy(config.retry.clone())
            .circuit_breaker(config.circuit_breaker.clone())
            .cache_policies(config.cache.clone())
            .janitor_interval(config.janitor_interval())
            .build())
    }

    // ========================================================================
    // REGISTRATION
    // ========================================================================

    pub fn register_query(&self, descriptor: QueryDescriptor) -> ClientResult<QueryEndpoint> {
        lock(&self.inner.registry).register_query(descriptor)
    }

    pub fn register_mutation(&self, descriptor: MutationDescriptor) -> ClientResult<MutationEndpoint> {
        lock(&self.inner.registry).register_mutation(descriptor)
    }

    pub fn query_endpoint(&self, name: &str) -> Option<QueryEndpoint> {
        lock(&self.inner.registry).query(name)
    }

    pub fn mutation_endpoint(&self, name: &str) -> Option<MutationEndpoint> {
        lock(&self.inner.registry).mutation(name)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Subscribe to `endpoint` with `params`.
    ///
    /// Starts a fetch when the cache has nothing usable and none is in
    /// flight. `cancel` ends the subscription.
    pub fn query(&self, endpoint: &QueryEndpoint, params: Params, cancel: &CancellationToken) -> Subscription {
        let signature = endpoint.signature(&params);
        let tags = endpoint.tags(&params, None);
        let subscribed = {
            let mut origins = lock(&self.inner.origins);
            origins.insert(signature.clone(), (endpoint.clone(), params.clone()));
            self.inner
                .store
                .subscribe(&signature, endpoint.cache_class(), tags)
        };
        if let FetchDecision::Start(ticket) = subscribed.decision {
            ClientInner::spawn_fetch(&self.inner, endpoint.clone(), params, ticket);
        }

        Subscription::new(
            Arc::clone(&self.inner.store),
            signature,
            subscribed.id,
            subscribed.events,
            cancel,
        )
    }

    /// Cached state for `endpoint` with `params`, without subscribing.
    pub fn cached(&self, endpoint: &QueryEndpoint, params: &Params) -> Option<EntryView> {
        self.inner.store.get(&endpoint.signature(params))
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    /// Run a mutation, optionally rewriting the cache first.
    ///
    /// On success the rewrites stay, the endpoint's tags are invalidated and
    /// watched entries refetch. On failure or cancellation every rewrite is
    /// rolled back before the error is returned.
    pub async fn mutate(
        &self,
        endpoint: &MutationEndpoint,
        params: Params,
        body: Option<Value>,
        options: MutateOptions,
    ) -> SyncResult<Value> {
        let spec = endpoint.request_spec(&params, body)?;
        let signature = endpoint.signature(&params);
        let cancel = options.cancel.unwrap_or_default();
        let id = MutationId::new();

        self.inner.applier.begin(
            id,
            options.optimistic,
            endpoint.invalidated_tags(&params, None),
        )?;

        let policy = self.inner.policy_for(endpoint.is_retryable());
        let outcome = self
            .inner
            .execute_with_retry(endpoint.name(), &signature, &spec, &policy, &cancel)
            .await;

        match outcome {
            RetryOutcome::Completed {
                response: Response::Ok(value),
                attempts,
                ..
            } => {
                let report = self.inner.applier.commit(id)?;
                info!(mutation = %id, endpoint = endpoint.name(), attempts, "Mutation committed");
                ClientInner::spawn_refetches(&self.inner, &report);
                Ok(value)
            }
            RetryOutcome::Completed {
                response: Response::Failed(failure),
                attempts,
                disposition,
            } => {
                self.inner.applier.rollback(id)?;
                let disposition = disposition.unwrap_or_else(|| classify(&failure));
                Err(self.inner.surface(endpoint.name(), failure, disposition, attempts))
            }
            RetryOutcome::Cancelled { .. } => {
                self.inner.applier.rollback(id)?;
                debug!(mutation = %id, endpoint = endpoint.name(), "Mutation cancelled");
                Err(SyncError::Cancelled)
            }
            RetryOutcome::CircuitOpen => {
                self.inner.applier.rollback(id)?;
                Err(self.inner.circuit_open(endpoint.name()))
            }
        }
    }

    // ========================================================================
    // INVALIDATION & MAINTENANCE
    // ========================================================================

    /// Invalidate `tags` and refetch watched entries.
    pub fn invalidate(&self, tags: &[Tag]) -> InvalidationReport {
        let report = self.inner.store.invalidate(tags);
        ClientInner::spawn_refetches(&self.inner, &report);
        report
    }

    /// Sweep expired entries every `interval` until `cancel` fires.
    ///
    /// Clients from [`from_config`](Self::from_config) already run one.
    pub fn start_janitor(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        ClientInner::start_janitor(&self.inner, interval, cancel)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.store.stats()
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.inner.retry_metrics.snapshot()
    }

    pub fn circuit_state(&self, endpoint: &str) -> CircuitState {
        self.inner.breakers.state(endpoint)
    }

    /// Close every circuit, e.g. after the user reconnects.
    pub fn reset_circuits(&self) {
        self.inner.breakers.reset_all();
    }

    pub fn pending_mutations(&self) -> usize {
        self.inner.applier.pending_count()
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }
}

impl ClientInner {
    fn policy_for(&self, retryable: bool) -> RetryPolicy {
        if retryable {
            self.retry.clone()
        } else {
            RetryPolicy::no_retry()
        }
    }

    async fn execute_with_retry(
        &self,
        endpoint: &str,
        signature: &RequestSignature,
        spec: &RequestSpec,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> RetryOutcome {
        let guard = AttemptGuard {
            endpoint,
            breakers: &self.breakers,
            metrics: &self.retry_metrics,
        };
        run_guarded(
            |_attempt| self.adapter.execute(signature, spec, cancel),
            policy,
            cancel,
            Some(guard),
        )
        .await
    }

    fn circuit_open(&self, endpoint: &str) -> SyncError {
        warn!(
            endpoint,
            recovery_timeout_ms = millis(self.breakers.policy().recovery_timeout()),
            "Circuit open, request not sent"
        );
        SyncError::CircuitOpen {
            endpoint: endpoint.to_string(),
        }
    }

    fn start_janitor(this: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let client: Weak<Self> = Arc::downgrade(this);
        spawn_janitor(Arc::clone(&this.store), interval, cancel, move |evicted| {
            if let Some(client) = client.upgrade() {
                client.forget(evicted);
            }
        })
    }

    /// Drop refetch recipes for signatures the store no longer holds.
    fn forget(&self, signatures: &[RequestSignature]) {
        let mut origins = lock(&self.origins);
        for signature in signatures {
            if !self.store.contains(signature) {
                origins.remove(signature);
            }
        }
    }

    /// Turn a terminal failure into the surfaced error, logging it and
    /// telling the auth hook about 401 and 403.
    fn surface(&self, endpoint: &str, failure: Failure, disposition: Disposition, attempts: u32) -> SyncError {
        let error = SyncError::from_failure(endpoint, failure, disposition, attempts);
        if let Some(request) = error.request_failure() {
            warn!(
                endpoint,
                status = %request.status,
                disposition = %disposition,
                attempts,
                code = %request.report.code,
                correlation_id = request.report.correlation_id.as_deref().unwrap_or(""),
                "Request failed"
            );
            if disposition.notifies_auth_hook() {
                self.auth_hook.on_auth_failure(disposition, request);
            }
        }
        error
    }

    fn spawn_fetch(this: &Arc<Self>, endpoint: QueryEndpoint, params: Params, ticket: FetchTicket) {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            inner.drive_fetch(endpoint, params, ticket).await;
        });
    }

    /// Run one fetch to completion and report it to the store, refetching
    /// while results land stale under active subscribers.
    async fn drive_fetch(&self, endpoint: QueryEndpoint, params: Params, mut ticket: FetchTicket) {
        loop {
            let spec = match endpoint.request_spec(&params) {
                Ok(spec) => spec,
                Err(err) => {
                    if self.store.fail_fetch(&ticket, err) == Settlement::Ignored {
                        self.forget(std::slice::from_ref(&ticket.signature));
                    }
                    return;
                }
            };
            let policy = self.policy_for(endpoint.is_retryable());
            let outcome = self
                .execute_with_retry(endpoint.name(), &ticket.signature, &spec, &policy, &ticket.cancel)
                .await;

            let settlement = match outcome {
                RetryOutcome::Completed {
                    response: Response::Ok(value),
                    ..
                } => {
                    let tags = endpoint.tags(&params, Some(&value));
                    self.store.complete_fetch(&ticket, value, tags)
                }
                RetryOutcome::Completed {
                    response: Response::Failed(failure),
                    attempts,
                    disposition,
                } => {
                    let disposition = disposition.unwrap_or_else(|| classify(&failure));
                    let error = self.surface(endpoint.name(), failure, disposition, attempts);
                    self.store.fail_fetch(&ticket, error)
                }
                RetryOutcome::Cancelled { attempts } => {
                    debug!(signature = %ticket.signature, attempts, "Fetch cancelled");
                    self.store.cancel_fetch(&ticket);
                    self.forget(std::slice::from_ref(&ticket.signature));
                    return;
                }
                RetryOutcome::CircuitOpen => {
                    let error = self.circuit_open(endpoint.name());
                    self.store.fail_fetch(&ticket, error)
                }
            };

            match settlement {
                Settlement::Applied {
                    needs_refetch: true,
                    ..
                } => match self.store.begin_fetch(&ticket.signature) {
                    Some(next) => ticket = next,
                    None => return,
                },
                Settlement::Applied { .. } => return,
                // The entry was dropped or refetched while this one ran.
                Settlement::Ignored => {
                    self.forget(std::slice::from_ref(&ticket.signature));
                    return;
                }
            }
        }
    }

    fn spawn_refetches(this: &Arc<Self>, report: &InvalidationReport) {
        if report.refetch.is_empty() {
            return;
        }
        let work: Vec<(QueryEndpoint, Params, FetchTicket)> = {
            let origins = lock(&this.origins);
            report
                .refetch
                .iter()
                .filter_map(|signature| {
                    let (endpoint, params) = origins.get(signature)?.clone();
                    let ticket = this.store.begin_fetch(signature)?;
                    Some((endpoint, params, ticket))
                })
                .collect()
        };
        for (endpoint, params, ticket) in work {
            Self::spawn_fetch(this, endpoint, params, ticket);
        }
    }
}
