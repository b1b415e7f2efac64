//! Operation descriptors and the endpoint registry.
//!
//! Every query and mutation is described once: name, method, path template,
//! the tags it provides or invalidates, its cache class and whether it may
//! be retried. Registration returns a typed handle that callers pass to
//! [`crate::SyncClient`].

use bricksync_core::{CacheClass, Method, Params, RequestSignature, SyncError, SyncResult, Tag, TagSet};
use bricksync_transport::RequestSpec;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{ClientError, ClientResult};

/// Computes tags from the request parameters and, when known, the result.
pub type TagsFn = Arc<dyn Fn(&Params, Option<&Value>) -> Vec<Tag> + Send + Sync>;

fn no_tags() -> TagsFn {
    Arc::new(|_, _| Vec::new())
}

// ============================================================================
// DESCRIPTORS
// ============================================================================

pub struct QueryDescriptor {
    name: String,
    path: String,
    provides: TagsFn,
    cache_class: CacheClass,
    retryable: bool,
}

impl QueryDescriptor {
    /// A `GET` on `path`, which may contain `{param}` placeholders.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            provides: no_tags(),
            cache_class: CacheClass::default(),
            retryable: true,
        }
    }

    pub fn provides<F>(mut self, f: F) -> Self
    where
        F: Fn(&Params, Option<&Value>) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.provides = Arc::new(f);
        self
    }

    pub fn cache_class(mut self, class: CacheClass) -> Self {
        self.cache_class = class;
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl fmt::Debug for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("cache_class", &self.cache_class)
            .field("retryable", &self.retryable)
            .finish_non_exhaustive()
    }
}

pub struct MutationDescriptor {
    name: String,
    method: Method,
    path: String,
    invalidates: TagsFn,
    retryable: bool,
}

impl MutationDescriptor {
    /// Mutations are not retried unless marked otherwise.
    pub fn new(name: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method,
            path: path.into(),
            invalidates: no_tags(),
            retryable: false,
        }
    }

    pub fn invalidates<F>(mut self, f: F) -> Self
    where
        F: Fn(&Params, Option<&Value>) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.invalidates = Arc::new(f);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl fmt::Debug for MutationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationDescriptor")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("retryable", &self.retryable)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// HANDLES
// ============================================================================

/// Registered query.
#[derive(Debug, Clone)]
pub struct QueryEndpoint(Arc<QueryDescriptor>);

impl QueryEndpoint {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn cache_class(&self) -> CacheClass {
        self.0.cache_class
    }

    pub fn is_retryable(&self) -> bool {
        self.0.retryable
    }

    pub fn signature(&self, params: &Params) -> RequestSignature {
        RequestSignature::new(&self.0.name, params)
    }

    pub fn tags(&self, params: &Params, result: Option<&Value>) -> TagSet {
        (self.0.provides)(params, result).into_iter().collect()
    }

    pub fn request_spec(&self, params: &Params) -> SyncResult<RequestSpec> {
        let (path, rest) = expand_path(&self.0.name, &self.0.path, params)?;
        Ok(RequestSpec::get(path).with_query(rest.to_query_pairs()))
    }
}

/// Registered mutation.
#[derive(Debug, Clone)]
pub struct MutationEndpoint(Arc<MutationDescriptor>);

impl MutationEndpoint {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn method(&self) -> Method {
        self.0.method
    }

    pub fn is_retryable(&self) -> bool {
        self.0.retryable
    }

    pub fn signature(&self, params: &Params) -> RequestSignature {
        RequestSignature::new(&self.0.name, params)
    }

    pub fn invalidated_tags(&self, params: &Params, result: Option<&Value>) -> Vec<Tag> {
        (self.0.invalidates)(params, result)
    }

    /// Placeholders come from `params`; leftovers go to the query string.
    pub fn request_spec(&self, params: &Params, body: Option<Value>) -> SyncResult<RequestSpec> {
        let (path, rest) = expand_path(&self.0.name, &self.0.path, params)?;
        let spec = RequestSpec::new(self.0.method, path).with_query(rest.to_query_pairs());
        Ok(match body {
            Some(body) => spec.with_body(body),
            None => spec,
        })
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Names are unique across queries and mutations.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    queries: BTreeMap<String, QueryEndpoint>,
    mutations: BTreeMap<String, MutationEndpoint>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_free(&self, name: &str) -> ClientResult<()> {
        if self.queries.contains_key(name) || self.mutations.contains_key(name) {
            return Err(ClientError::DuplicateEndpoint {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn register_query(&mut self, descriptor: QueryDescriptor) -> ClientResult<QueryEndpoint> {
        self.ensure_free(&descriptor.name)?;
        let endpoint = QueryEndpoint(Arc::new(descriptor));
        self.queries
            .insert(endpoint.name().to_string(), endpoint.clone());
        Ok(endpoint)
    }

    pub fn register_mutation(&mut self, descriptor: MutationDescriptor) -> ClientResult<MutationEndpoint> {
        self.ensure_free(&descriptor.name)?;
        let endpoint = MutationEndpoint(Arc::new(descriptor));
        self.mutations
            .insert(endpoint.name().to_string(), endpoint.clone());
        Ok(endpoint)
    }

    pub fn query(&self, name: &str) -> Option<QueryEndpoint> {
        self.queries.get(name).cloned()
    }

    pub fn mutation(&self, name: &str) -> Option<MutationEndpoint> {
        self.mutations.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.queries.keys().chain(self.mutations.keys()).cloned().collect()
    }
}

// ============================================================================
// PATH TEMPLATES
// ============================================================================

/// Substitute `{name}` placeholders, returning the path and unused params.
fn expand_path(endpoint: &str, template: &str, params: &Params) -> SyncResult<(String, Params)> {
    let invalid = |reason: String| SyncError::InvalidRequest {
        endpoint: endpoint.to_string(),
        reason,
    };

    let mut path = String::with_capacity(template.len());
    let mut used = BTreeSet::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        path.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| invalid(format!("unclosed placeholder in '{}'", template)))?;
        let name = &after[..close];
        let value = params
            .get(name)
            .ok_or_else(|| invalid(format!("missing path parameter '{}'", name)))?;
        let segment = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Err(invalid(format!("path parameter '{}' must be a scalar", name))),
        };
        path.push_str(&urlencoding::encode(&segment));
        used.insert(name);
        rest = &after[close + 1..];
    }
    path.push_str(rest);

    let mut unused = Params::new();
    for (key, value) in params.iter() {
        if !used.contains(key) {
            unused.insert(key, value.clone());
        }
    }
    Ok((path, unused))
}
