//! Scripted transport for pipeline and event loop tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::error::TransportError;
use crate::http::{duration_ms, HttpRequest, HttpResponse};
use crate::transport::Transport;

/// Longest a scripted call blocks waiting for a response to be pushed.
const MAX_HANG: Duration = Duration::from_secs(3);

/// How often a parked call looks at its cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// Hands out pushed results in order. When the script is empty a call
/// blocks until something is pushed or its deadline passes, which is how a
/// long poll with no events behaves. A cancelled call returns
/// `TransportError::Cancelled` without taking a scripted result.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    pushed: Condvar,
    requests: Mutex<Vec<(Instant, HttpRequest)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Behave like a blocking socket read that cannot be interrupted.
    ignore_cancel: bool,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn ignoring_cancellation() -> Self {
        Self {
            ignore_cancel: true,
            ..Self::default()
        }
    }

    pub(crate) fn push(&self, status: u16, body: &str) {
        self.push_result(Ok(HttpResponse::new(status, body)));
    }

    pub(crate) fn push_failure(&self, error: TransportError) {
        self.push_result(Err(error));
    }

    pub(crate) fn push_result(&self, result: Result<HttpResponse, TransportError>) {
        self.script.lock().push_back(result);
        self.pushed.notify_all();
    }

    /// Every request executed so far, as stamped by the pipeline.
    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    /// When each request reached the transport.
    pub(crate) fn request_times(&self) -> Vec<Instant> {
        self.requests.lock().iter().map(|(at, _)| *at).collect()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Block until at least `count` requests were executed.
    pub(crate) fn wait_for_requests(&self, count: usize, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if self.request_count() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.request_count() >= count
    }
}

impl Transport for ScriptedTransport {
    fn execute(
        &self,
        request: &HttpRequest,
        cancel: &CancelToken,
    ) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push((Instant::now(), request.clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let deadline = Instant::now() + request.timeout.min(MAX_HANG);
        let mut script = self.script.lock();
        let result = loop {
            if cancel.is_cancelled() && !self.ignore_cancel {
                break Err(TransportError::Cancelled);
            }
            if let Some(next) = script.pop_front() {
                break next;
            }
            if Instant::now() >= deadline {
                break Err(TransportError::Timeout {
                    timeout_ms: duration_ms(request.timeout),
                });
            }
            let slice = (Instant::now() + CANCEL_POLL).min(deadline);
            self.pushed.wait_until(&mut script, slice);
        };
        drop(script);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
