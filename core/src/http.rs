//! HTTP request and response descriptors.
//!
//! # Design
//! Requests and responses are plain data. The core builds `HttpRequest`
//! values and interprets `HttpResponse` values; a `Transport` performs the
//! actual I/O. The request URL may carry the load-balancer placeholder
//! [`LB_PLACEHOLDER`], which the pipeline replaces with a shard id on a copy
//! of the request at dispatch time. The caller's descriptor is never changed.
//!
//! All fields use owned types so descriptors can move freely between the
//! caller, the pipeline and its dispatch threads.

use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bundle::Bundle;
use crate::error::TransportError;

/// Token in a URL that is replaced by the chosen load-balancer shard id.
pub const LB_PLACEHOLDER: &str = "[id]";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Whole milliseconds of `d`, saturating at `u64::MAX`.
pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// When a failed call is retried by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryPolicy {
    /// Never retry; the first answer is final.
    Never,
    /// Retry transport failures, odd statuses (<100, 3xx) and 5xx.
    #[default]
    NonpermanentErrors,
    /// Retry every non-2xx answer, 4xx included.
    AllErrors,
}

impl RetryPolicy {
    /// Whether `response` should be retried under this policy.
    pub fn should_retry(&self, response: &HttpResponse) -> bool {
        let status = response.status;
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::NonpermanentErrors => {
                response.is_transport_failure()
                    || status < 100
                    || (300..400).contains(&status)
                    || status >= 500
            }
            RetryPolicy::AllErrors => {
                response.is_transport_failure() || status < 100 || status >= 300
            }
        }
    }
}

/// Coarse classification of a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection, DNS or timeout failure; no status was received.
    Transport,
    /// 4xx.
    Client,
    /// 5xx.
    Server,
    /// 3xx or a status below 100.
    RedirectOrAmbiguous,
}

/// An HTTP request described as plain data.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    /// Explicit method; `None` infers GET without a body and POST with one.
    pub method: Option<HttpMethod>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub retry_policy: RetryPolicy,
    pub timeout: Duration,
    /// Dispatch immediately instead of waiting behind the managed queue.
    pub bypass_queue: bool,
    /// Number of load-balancer shards; 0 or 1 disables rotation.
    pub load_balancer_count: u32,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: None,
            headers: Vec::new(),
            body: None,
            retry_policy: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            bypass_queue: false,
            load_balancer_count: 0,
        }
    }

    pub fn method(&self) -> HttpMethod {
        match (self.method, &self.body) {
            (Some(method), _) => method,
            (None, Some(_)) => HttpMethod::Post,
            (None, None) => HttpMethod::Get,
        }
    }

    /// Set a header, replacing any existing one with the same name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    /// Attach `body` as JSON.
    pub fn with_body(mut self, body: &Bundle) -> Self {
        self.body = Some(body.to_json().into_bytes());
        self.set_header("content-type", "application/json");
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_bypass_queue(mut self, bypass: bool) -> Self {
        self.bypass_queue = bypass;
        self
    }

    pub fn with_load_balancer_count(mut self, count: u32) -> Self {
        self.load_balancer_count = count;
        self
    }

    /// Copy of this request with the placeholder replaced by `shard`.
    pub fn stamped(&self, shard: u32) -> HttpRequest {
        let mut copy = self.clone();
        copy.url = self.url.replace(LB_PLACEHOLDER, &shard.to_string());
        copy
    }
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// Status code; 0 when the call failed before any status was received.
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub error: Option<TransportError>,
    parsed: OnceLock<Bundle>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn transport_failure(error: TransportError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_transport_failure(&self) -> bool {
        self.error.is_some()
    }

    /// 2xx and no transport error.
    pub fn is_success(&self) -> bool {
        !self.is_transport_failure() && (200..300).contains(&self.status)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        if self.is_transport_failure() {
            return Some(FailureKind::Transport);
        }
        match self.status {
            200..=299 => None,
            400..=499 => Some(FailureKind::Client),
            500..=u16::MAX => Some(FailureKind::Server),
            _ => Some(FailureKind::RedirectOrAmbiguous),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body decoded as a `Bundle`, parsed on first access and cached.
    /// Empty or malformed bodies yield `Bundle::Null`.
    pub fn bundle(&self) -> &Bundle {
        self.parsed.get_or_init(|| {
            if self.body.is_empty() {
                return Bundle::Null;
            }
            std::str::from_utf8(&self.body)
                .ok()
                .and_then(|text| Bundle::from_json(text).ok())
                .unwrap_or_default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> HttpResponse {
        HttpResponse::transport_failure(TransportError::Timeout { timeout_ms: 10 })
    }

    #[test]
    fn duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_ms(Duration::from_micros(999)), 0);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
    }

    #[test]
    fn never_policy_never_retries() {
        for status in [0u16, 99, 200, 302, 404, 500, 503] {
            assert!(!RetryPolicy::Never.should_retry(&HttpResponse::new(status, "")));
        }
        assert!(!RetryPolicy::Never.should_retry(&timeout()));
    }

    #[test]
    fn transport_failures_are_retried_by_other_policies() {
        assert!(RetryPolicy::NonpermanentErrors.should_retry(&timeout()));
        assert!(RetryPolicy::AllErrors.should_retry(&timeout()));

        // The status is meaningless once a transport error is present.
        let mut masked = timeout();
        masked.status = 200;
        assert!(RetryPolicy::NonpermanentErrors.should_retry(&masked));
        assert!(!masked.is_success());
    }

    #[test]
    fn nonpermanent_policy_skips_client_errors() {
        let p = RetryPolicy::NonpermanentErrors;
        assert!(p.should_retry(&HttpResponse::new(50, "")));
        assert!(p.should_retry(&HttpResponse::new(301, "")));
        assert!(p.should_retry(&HttpResponse::new(503, "")));
        assert!(!p.should_retry(&HttpResponse::new(200, "")));
        assert!(!p.should_retry(&HttpResponse::new(204, "")));
        assert!(!p.should_retry(&HttpResponse::new(403, "")));
    }

    #[test]
    fn all_errors_policy_includes_client_errors() {
        let p = RetryPolicy::AllErrors;
        assert!(p.should_retry(&HttpResponse::new(403, "")));
        assert!(p.should_retry(&HttpResponse::new(302, "")));
        assert!(!p.should_retry(&HttpResponse::new(201, "")));
    }

    #[test]
    fn failure_kinds() {
        assert_eq!(timeout().failure_kind(), Some(FailureKind::Transport));
        assert_eq!(HttpResponse::new(200, "").failure_kind(), None);
        assert_eq!(HttpResponse::new(401, "").failure_kind(), Some(FailureKind::Client));
        assert_eq!(HttpResponse::new(502, "").failure_kind(), Some(FailureKind::Server));
        assert_eq!(
            HttpResponse::new(304, "").failure_kind(),
            Some(FailureKind::RedirectOrAmbiguous)
        );
    }

    #[test]
    fn method_is_inferred_from_body() {
        let get = HttpRequest::new("http://x/v1/ping");
        assert_eq!(get.method(), HttpMethod::Get);

        let post = get.clone().with_body(&Bundle::object());
        assert_eq!(post.method(), HttpMethod::Post);
        assert_eq!(post.header("Content-Type"), Some("application/json"));

        let delete = post.with_method(HttpMethod::Delete);
        assert_eq!(delete.method(), HttpMethod::Delete);
    }

    #[test]
    fn set_header_replaces_case_insensitively() {
        let mut req = HttpRequest::new("http://x");
        req.set_header("X-ApiKey", "a");
        req.set_header("x-apikey", "b");
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header("X-APIKEY"), Some("b"));
    }

    #[test]
    fn stamping_leaves_the_original_untouched() {
        let req = HttpRequest::new("https://api[id].example.net/v1/ping");
        let stamped = req.stamped(2);
        assert_eq!(stamped.url, "https://api2.example.net/v1/ping");
        assert_eq!(req.url, "https://api[id].example.net/v1/ping");
    }

    #[test]
    fn bundle_view_is_parsed_lazily_and_tolerates_garbage() {
        let ok = HttpResponse::new(200, r#"{"id":"m1"}"#);
        assert_eq!(ok.bundle().get("id").as_str(""), "m1");
        assert!(std::ptr::eq(ok.bundle(), ok.bundle()));

        assert!(HttpResponse::new(200, "not json").bundle().is_null());
        assert!(HttpResponse::new(204, "").bundle().is_null());
    }
}
