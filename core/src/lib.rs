//! Client-side network runtime for the gamecloud backend.
//!
//! # Overview
//! Three pieces cooperate:
//! - `CloudClient` builds authenticated `HttpRequest` values and parses
//!   `HttpResponse` values. It never touches the network.
//! - `RequestPipeline` executes requests through a `Transport`: one managed
//!   request at a time in submission order, with retries on a backoff
//!   schedule and a fresh load-balancer shard for every attempt.
//! - `DomainEventLoop` long-polls one event domain on a worker thread,
//!   acknowledges each delivered message on the next poll, and can be
//!   suspended, resumed or stopped from any thread.
//!
//! # Design
//! - Everything is blocking and thread-based. Callbacks fire on pipeline
//!   dispatch threads; listeners fire on the event loop's worker.
//! - `Transport` is the only I/O seam. `UreqTransport` is the production
//!   implementation; tests substitute a scripted one. Every call carries a
//!   `CancelToken` that the pipeline fires on abort.
//! - JSON payloads travel as `Bundle`, a dynamic value with lenient typed
//!   accessors.
//! - DTOs are defined independently from the mock-server crate; integration
//!   tests catch schema drift.

pub mod bundle;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod http;
pub mod pipeline;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use bundle::Bundle;
pub use cancel::{new_cancel_pair, CancelHandle, CancelToken};
pub use client::CloudClient;
pub use config::{ClientConfig, EventLoopConfig, PipelineConfig};
pub use error::{ApiError, BundleError, ConfigError, LoopError, PipelineError, TransportError};
pub use event_loop::{DomainEventLoop, LoopStatus};
pub use http::{HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use pipeline::{RequestHandle, RequestPipeline};
pub use registry::LoopRegistry;
pub use transport::{Transport, UreqTransport};
pub use types::{DomainEvent, GamerCredentials, DEFAULT_DOMAIN};
