//! Blocking HTTP transport.
//!
//! # Design
//! The pipeline hands a fully stamped `HttpRequest` to a `Transport` and
//! gets back either an `HttpResponse` or a `TransportError`. Every status
//! code, 4xx and 5xx included, comes back as data: interpreting it is the
//! pipeline's job, not the transport's. Timeouts are hard per-call
//! deadlines taken from `HttpRequest::timeout`.
//!
//! Each call gets a `CancelToken`. Implementations return
//! `TransportError::Cancelled` as soon as they notice it fired. `ureq`
//! cannot interrupt a blocking read from another thread, so
//! `UreqTransport` checks the token before sending and after the exchange.
//! A cancelled call already waiting on the socket runs to its own
//! deadline. The pipeline keeps the managed slot until then, and the event
//! loop does not open another poll until it has returned.

use std::io;

use tracing::trace;

use crate::cancel::CancelToken;
use crate::error::TransportError;
use crate::http::{duration_ms, HttpMethod, HttpRequest, HttpResponse};

/// Executes one HTTP call. Implementations must be callable concurrently
/// from several dispatch threads.
pub trait Transport: Send + Sync + 'static {
    fn execute(
        &self,
        request: &HttpRequest,
        cancel: &CancelToken,
    ) -> Result<HttpResponse, TransportError>;
}

/// `Transport` backed by a shared `ureq` agent.
#[derive(Debug, Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        // Status codes are returned as data so the retry policy can see them.
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .new_agent();
        Self { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UreqTransport {
    fn execute(
        &self,
        request: &HttpRequest,
        cancel: &CancelToken,
    ) -> Result<HttpResponse, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let timeout = Some(request.timeout);
        let url = request.url.as_str();
        trace!(method = request.method().as_str(), url, "executing request");

        let result = match (request.method(), request.body.as_deref()) {
            (HttpMethod::Get, _) => {
                let mut builder = self.agent.get(url);
                for (k, v) in &request.headers {
                    builder = builder.header(k.as_str(), v.as_str());
                }
                builder.config().timeout_global(timeout).build().call()
            }
            (HttpMethod::Delete, _) => {
                let mut builder = self.agent.delete(url);
                for (k, v) in &request.headers {
                    builder = builder.header(k.as_str(), v.as_str());
                }
                builder.config().timeout_global(timeout).build().call()
            }
            (method, body) => {
                let mut builder = match method {
                    HttpMethod::Put => self.agent.put(url),
                    _ => self.agent.post(url),
                };
                for (k, v) in &request.headers {
                    builder = builder.header(k.as_str(), v.as_str());
                }
                let builder = builder.config().timeout_global(timeout).build();
                match body {
                    Some(bytes) => builder.send(bytes),
                    None => builder.send_empty(),
                }
            }
        };

        let mut response = result.map_err(|e| map_ureq_error(e, request))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .body_mut()
            .read_to_vec()
            .map_err(|e| map_ureq_error(e, request))?;

        if cancel.is_cancelled() {
            trace!(url, status, "discarding response of cancelled call");
            return Err(TransportError::Cancelled);
        }
        Ok(HttpResponse::new(status, body).with_headers(headers))
    }
}

fn map_ureq_error(error: ureq::Error, request: &HttpRequest) -> TransportError {
    match error {
        ureq::Error::Timeout(_) => TransportError::Timeout {
            timeout_ms: duration_ms(request.timeout),
        },
        ureq::Error::Io(e) if e.kind() == io::ErrorKind::TimedOut => TransportError::Timeout {
            timeout_ms: duration_ms(request.timeout),
        },
        ureq::Error::Io(e) => TransportError::Io(e.to_string()),
        ureq::Error::BadUri(uri) => TransportError::InvalidRequest(uri),
        other => TransportError::Connection(other.to_string()),
    }
}
