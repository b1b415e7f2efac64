//! Canonical request signatures.
//!
//! A [`RequestSignature`] identifies one logical query: the endpoint name plus
//! its parameters. Two requests built with the same parameters in a different
//! order produce equal signatures, so the cache can key on them directly.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Named request parameters.
///
/// Kept sorted by name. `null` values are dropped on insert so an absent
/// parameter and an explicit `null` are the same request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    values: BTreeMap<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a parameter, removing it when the value is `null`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        match value.into() {
            Value::Null => {
                self.values.remove(&key);
            }
            value => {
                self.values.insert(key, value);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Get a parameter as a string slice, if it is a JSON string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Build from a JSON object. Non-object values yield empty params.
    pub fn from_json(value: Value) -> Self {
        let mut params = Self::new();
        if let Value::Object(map) = value {
            for (key, value) in map {
                params.insert(key, value);
            }
        }
        params
    }

    /// Flatten into URL query pairs.
    ///
    /// Strings are emitted unquoted, arrays become repeated keys and any other
    /// value uses its compact JSON text.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(self.values.len());
        for (key, value) in &self.values {
            match value {
                Value::Array(items) => {
                    for item in items {
                        pairs.push((key.clone(), query_text(item)));
                    }
                }
                other => pairs.push((key.clone(), query_text(other))),
            }
        }
        pairs
    }

    fn canonical(&self) -> String {
        let mut out = String::from("{");
        for (index, (key, value)) in self.values.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            out.push_str(&Value::String(key.clone()).to_string());
            out.push(':');
            write_canonical(value, &mut out);
        }
        out.push('}');
        out
    }
}

fn query_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Write compact JSON with object keys in sorted order at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Canonical key of a query: `endpoint({"param":value,...})`.
///
/// Immutable once built and cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestSignature {
    key: Arc<str>,
    endpoint_len: usize,
}

impl RequestSignature {
    pub fn new(endpoint: &str, params: &Params) -> Self {
        let key = format!("{}({})", endpoint, params.canonical());
        Self {
            key: Arc::from(key),
            endpoint_len: endpoint.len(),
        }
    }

    /// Signature of a parameterless endpoint.
    pub fn bare(endpoint: &str) -> Self {
        Self::new(endpoint, &Params::new())
    }

    pub fn endpoint(&self) -> &str {
        &self.key[..self.endpoint_len]
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl fmt::Debug for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestSignature").field(&self.key).finish()
    }
}
