//! Stateless request builder and response parser for the game backend.
//!
//! # Design
//! `CloudClient` holds only a `ClientConfig` and carries no mutable state
//! between calls. Each endpoint is split into a `build_*` method that
//! produces an `HttpRequest` and a `parse_*` method that consumes an
//! `HttpResponse`. Executing the request is the pipeline's job.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::config::{ClientConfig, EventLoopConfig};
use crate::error::ApiError;
use crate::http::{HttpRequest, HttpResponse, RetryPolicy};
use crate::types::{DomainEvent, GamerCredentials};

pub const HEADER_API_KEY: &str = "x-apikey";
pub const HEADER_API_SECRET: &str = "x-apisecret";
pub const HEADER_SDK_VERSION: &str = "x-sdkversion";

/// Builds authenticated requests from a `ClientConfig`.
#[derive(Debug, Clone)]
pub struct CloudClient {
    config: ClientConfig,
}

impl CloudClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Request signed with the application credentials only. `path` is
    /// appended to the server URL unless it is already absolute.
    pub fn build_request(&self, path: &str) -> HttpRequest {
        let url = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.config.server_url, path)
        };
        HttpRequest::new(url)
            .with_header(HEADER_API_KEY, self.config.api_key.as_str())
            .with_header(HEADER_API_SECRET, self.config.api_secret.as_str())
            .with_header(HEADER_SDK_VERSION, self.config.sdk_version.as_str())
            .with_header("user-agent", self.config.user_agent.as_str())
            .with_timeout(self.config.http_timeout())
            .with_load_balancer_count(self.config.load_balancer_count)
            .with_retry_policy(RetryPolicy::NonpermanentErrors)
    }

    /// Request additionally authenticated as `gamer` (HTTP Basic).
    pub fn build_gamer_request(&self, path: &str, gamer: &GamerCredentials) -> HttpRequest {
        let token = STANDARD.encode(format!("{}:{}", gamer.gamer_id, gamer.gamer_secret));
        self.build_request(path)
            .with_header("authorization", format!("Basic {token}"))
    }

    pub fn build_ping(&self) -> HttpRequest {
        self.build_request("/v1/ping")
    }

    pub fn parse_ping(&self, response: &HttpResponse) -> Result<(), ApiError> {
        check_status(response, 200)
    }

    /// Long-poll request for `domain`. `ack` acknowledges the previously
    /// delivered message.
    pub fn build_event_poll(
        &self,
        gamer: &GamerCredentials,
        domain: &str,
        timing: &EventLoopConfig,
        ack: Option<&str>,
    ) -> HttpRequest {
        let mut path = format!(
            "/v1/gamer/event/{}?timeout={}",
            urlencoding::encode(domain),
            timing.long_poll_timeout.as_millis()
        );
        if let Some(ack) = ack {
            path.push_str("&ack=");
            path.push_str(&urlencoding::encode(ack));
        }
        self.build_gamer_request(&path, gamer)
            .with_timeout(timing.request_timeout())
            .with_retry_policy(RetryPolicy::NonpermanentErrors)
            .with_bypass_queue(true)
    }

    /// `Ok(Some(event))` on 200, `Ok(None)` on 204.
    pub fn parse_event_poll(
        &self,
        domain: &str,
        response: &HttpResponse,
    ) -> Result<Option<DomainEvent>, ApiError> {
        if response.status == 204 && !response.is_transport_failure() {
            return Ok(None);
        }
        check_status(response, 200)?;
        let message = response.bundle();
        if !message.is_object() {
            return Err(ApiError::Deserialization(format!(
                "event body is not a JSON object: {}",
                response.text()
            )));
        }
        Ok(Some(DomainEvent::new(domain, message.clone())))
    }

    pub fn http_timeout(&self) -> Duration {
        self.config.http_timeout()
    }
}

/// Map transport failures and unexpected statuses to `ApiError`.
fn check_status(response: &HttpResponse, expected: u16) -> Result<(), ApiError> {
    if let Some(error) = &response.error {
        return Err(ApiError::Transport(error.clone()));
    }
    if response.status == expected {
        return Ok(());
    }
    if response.status == 404 {
        return Err(ApiError::NotFound);
    }
    Err(ApiError::Http {
        status: response.status,
        body: response.text(),
    })
}
