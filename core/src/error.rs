//! Error types for the gamecloud client runtime.
//!
//! # Design
//! `TransportError` is `Clone` because it travels inside `HttpResponse`, which
//! callers may copy freely. `NotFound` keeps its own `ApiError` variant since
//! callers often tell "the resource does not exist" apart from "the server
//! returned an unexpected status". Every other non-2xx response lands in
//! `Http` with the raw status and body for debugging.

use thiserror::Error;

use crate::event_loop::LoopStatus;

/// Failure of a single transport call. No status code was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("could not start dispatch thread: {0}")]
    Spawn(String),

    #[error("request was cancelled")]
    Cancelled,
}

/// Errors returned by `CloudClient` build and parse methods.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The server returned 404.
    #[error("resource not found")]
    NotFound,

    /// The server returned a non-2xx status other than 404.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// No status was received at all.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The response body could not be decoded.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

impl ApiError {
    /// True for 4xx answers, which mean the request itself is wrong
    /// (bad credentials, unknown domain) and repeating it is pointless.
    pub fn is_client_error(&self) -> bool {
        match self {
            ApiError::NotFound => true,
            ApiError::Http { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }
}

/// Errors surfaced by the blocking helpers of `RequestPipeline`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("request was aborted before it completed")]
    Aborted,

    /// A managed completion callback waited on a managed request of the
    /// same pipeline. That request could never start while the callback
    /// holds the slot.
    #[error("managed request awaited from a managed callback of the same pipeline")]
    Reentrant,
}

/// Errors from event loop lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    #[error("event loop cannot be started from state {status:?}")]
    InvalidState { status: LoopStatus },

    #[error("could not start event loop worker: {0}")]
    Spawn(String),
}

/// Errors from `Bundle` parsing and mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleError {
    #[error("invalid JSON: {0}")]
    Parse(String),

    #[error("bundle is not an object")]
    NotAnObject,

    #[error("bundle is not an array")]
    NotAnArray,

    #[error("index {index} out of range for array of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Errors from loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("could not parse configuration: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
