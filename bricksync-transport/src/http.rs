//! reqwest-backed transport.

use crate::adapter::{PreparedRequest, Transport};
use async_trait::async_trait;
use bricksync_core::{Failure, Method, Response};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid header value for {name}: {reason}")]
    InvalidHeader { name: &'static str, reason: String },
}

/// Credentials attached to every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub jwt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub credentials: Credentials,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(30),
            credentials: Credentials::default(),
        }
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth_headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(config: &HttpTransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let auth_headers = build_auth_headers(&config.credentials)?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_headers,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: PreparedRequest) -> Response {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), url)
            .headers(self.auth_headers.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(path = %request.path, error = %err, "Request failed before a response");
                return Response::Failed(Failure::network(err.to_string()));
            }
        };

        let status = response.status();
        let retry_after = parse_retry_after(response.headers(), Utc::now());
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(path = %request.path, error = %err, "Failed to read response body");
                return Response::Failed(Failure::network(err.to_string()));
            }
        };

        let parsed = if bytes.is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_slice::<Value>(&bytes)
        };

        if status.is_success() {
            return match parsed {
                Ok(value) => Response::Ok(value),
                Err(err) => {
                    warn!(path = %request.path, status = status.as_u16(), error = %err, "Undecodable success body");
                    Response::Failed(Failure::http(
                        status.as_u16(),
                        Value::String(String::from_utf8_lossy(&bytes).into_owned()),
                    ))
                }
            };
        }

        let body = parsed.unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        let mut failure = Failure::http(status.as_u16(), body);
        failure.retry_after = retry_after;
        Response::Failed(failure)
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn build_auth_headers(auth: &Credentials) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(api_key).map_err(|e| TransportError::InvalidHeader {
                name: "x-api-key",
                reason: e.to_string(),
            })?,
        );
    }
    if let Some(jwt) = &auth.jwt {
        let value = format!("Bearer {}", jwt);
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&value).map_err(|e| TransportError::InvalidHeader {
                name: "authorization",
                reason: e.to_string(),
            })?,
        );
    }
    Ok(headers)
}

/// `Retry-After` as delta seconds or an HTTP date relative to `now`.
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_retry_after_seconds() {
        let parsed = parse_retry_after(&headers_with("120"), Utc::now());
        assert_eq!(parsed, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        let parsed = parse_retry_after(&headers_with("Wed, 21 Oct 2015 07:28:00 GMT"), now);
        assert_eq!(parsed, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_retry_after_in_the_past_is_zero() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 8, 0, 0).unwrap();
        let parsed = parse_retry_after(&headers_with("Wed, 21 Oct 2015 07:28:00 GMT"), now);
        assert_eq!(parsed, Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_after_garbage_is_ignored() {
        assert_eq!(parse_retry_after(&headers_with("soon"), Utc::now()), None);
        assert_eq!(parse_retry_after(&HeaderMap::new(), Utc::now()), None);
    }

    #[test]
    fn test_auth_headers() {
        let headers = build_auth_headers(&Credentials {
            api_key: Some("key-1".to_string()),
            jwt: Some("token-1".to_string()),
        })
        .unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "key-1");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer token-1");
    }

    #[test]
    fn test_auth_headers_reject_newlines() {
        let result = build_auth_headers(&Credentials {
            api_key: Some("bad\nkey".to_string()),
            jwt: None,
        });
        assert!(matches!(
            result,
            Err(TransportError::InvalidHeader { name: "x-api-key", .. })
        ));
    }
}
