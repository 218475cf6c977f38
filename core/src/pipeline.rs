//! Single-flight request pipeline with retry, backoff and load-balancer
//! rotation.
//!
//! # Design
//! A pipeline owns one managed slot and a FIFO queue. Requests without the
//! bypass flag take the slot when it is free and wait in the queue
//! otherwise; bypass requests skip both and run at once. Each dispatched
//! request runs its whole attempt chain on its own dispatch thread: pick a
//! shard, call the transport, and either sleep and retry or deliver the
//! final response.
//!
//! Bookkeeping lives behind one mutex, but callbacks always run with the
//! lock released. The slot is released only after a managed request's
//! callback returned, so managed callbacks fire in submission order.
//!
//! Callbacks are `FnOnce` and stored in the `active` table while their
//! request runs. Delivering or aborting removes the entry, which is what
//! makes "at most once, never after abort" hold. Aborting also fires the
//! chain's cancel handle. The chain itself keeps the slot until its
//! transport call has returned, so at most one managed call is ever open.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cancel::{new_cancel_pair, CancelHandle, CancelToken};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, TransportError};
use crate::http::{duration_ms, HttpRequest, HttpResponse};
use crate::transport::Transport;

/// Completion callback of a submitted request.
pub type Callback = Box<dyn FnOnce(HttpResponse) + Send + 'static>;

thread_local! {
    // Pipeline whose managed callback is running on this thread, 0 if none.
    static MANAGED_CALLBACK: Cell<usize> = const { Cell::new(0) };
}

/// Identifies a submitted request, for `RequestPipeline::abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    id: Uuid,
}

impl RequestHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Cloneable handle to a request pipeline. Clones share one queue.
#[derive(Clone)]
pub struct RequestPipeline {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: PipelineConfig,
    state: Mutex<PipelineState>,
    /// Signalled whenever an attempt chain exits.
    settled: Condvar,
}

#[derive(Default)]
struct PipelineState {
    /// Managed request holding the single-flight slot.
    in_flight: Option<Uuid>,
    queue: VecDeque<Queued>,
    /// Callbacks of every dispatched request, managed and bypass.
    active: HashMap<Uuid, Callback>,
    /// Attempt chains whose thread has not exited yet, aborted ones included.
    running: HashMap<Uuid, CancelHandle>,
}

impl PipelineState {
    fn dispatch(&mut self, id: Uuid, callback: Callback) -> CancelToken {
        let (token, handle) = new_cancel_pair();
        self.active.insert(id, callback);
        self.running.insert(id, handle);
        token
    }

    fn is_pending(&self, id: Uuid) -> bool {
        self.running.contains_key(&id) || self.queue.iter().any(|q| q.id == id)
    }
}

struct Queued {
    id: Uuid,
    request: HttpRequest,
    callback: Callback,
}

impl RequestPipeline {
    pub fn new<T: Transport>(transport: Arc<T>, config: PipelineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state: Mutex::new(PipelineState::default()),
                settled: Condvar::new(),
            }),
        }
    }

    /// Submit `request`; `callback` fires exactly once with the final
    /// response unless the request is aborted first.
    pub fn submit<F>(&self, request: HttpRequest, callback: F) -> RequestHandle
    where
        F: FnOnce(HttpResponse) + Send + 'static,
    {
        let id = Uuid::new_v4();
        let callback: Callback = Box::new(callback);
        let cancel = {
            let mut state = self.inner.state.lock();
            if !request.bypass_queue {
                if state.in_flight.is_some() {
                    state.queue.push_back(Queued {
                        id,
                        request,
                        callback,
                    });
                    debug!(request_id = %id, queued = state.queue.len(), "pipeline busy, request queued");
                    return RequestHandle { id };
                }
                state.in_flight = Some(id);
            }
            state.dispatch(id, callback)
        };
        self.inner.spawn_chain(id, request, cancel);
        RequestHandle { id }
    }

    /// Submit `request` and block the calling thread until it completes.
    ///
    /// A managed callback holds the slot until it returns, so waiting there
    /// for another managed request of the same pipeline could never finish.
    /// That case fails with `PipelineError::Reentrant`; bypass requests
    /// are fine.
    pub fn submit_and_wait(&self, request: HttpRequest) -> Result<HttpResponse, PipelineError> {
        if !request.bypass_queue && MANAGED_CALLBACK.with(Cell::get) == self.inner.key() {
            return Err(PipelineError::Reentrant);
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(request, move |response| {
            let _ = tx.send(response);
        });
        // An aborted request drops its callback, and with it the sender.
        rx.recv().map_err(|_| PipelineError::Aborted)
    }

    /// Abort a queued or running request. Its callback will not fire, its
    /// transport call is cancelled and no retry follows. Returns false if
    /// the request already completed.
    pub fn abort(&self, handle: &RequestHandle) -> bool {
        let id = handle.id;
        let mut state = self.inner.state.lock();

        if let Some(pos) = state.queue.iter().position(|q| q.id == id) {
            let removed = state.queue.remove(pos);
            drop(state);
            drop(removed);
            debug!(request_id = %id, "queued request aborted");
            return true;
        }

        let Some(callback) = state.active.remove(&id) else {
            return false;
        };
        if let Some(cancel) = state.running.get(&id) {
            cancel.cancel();
        }
        drop(state);
        drop(callback);
        debug!(request_id = %id, "in-flight request aborted");
        true
    }

    /// Block until the request's attempt chain has exited, i.e. its last
    /// transport call returned. False if `timeout` passed first.
    pub fn wait_settled(&self, handle: &RequestHandle, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.is_pending(handle.id) {
            if Instant::now() >= deadline {
                return false;
            }
            self.inner.settled.wait_until(&mut state, deadline);
        }
        true
    }

    /// No managed request is running or waiting.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.in_flight.is_none() && state.queue.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Dispatched requests, managed and bypass, whose callback is pending.
    pub fn active_len(&self) -> usize {
        self.inner.state.lock().active.len()
    }
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RequestPipeline")
            .field("in_flight", &state.in_flight)
            .field("queued", &state.queue.len())
            .field("active", &state.active.len())
            .field("running", &state.running.len())
            .finish()
    }
}

impl Inner {
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn spawn_chain(self: &Arc<Self>, id: Uuid, request: HttpRequest, cancel: CancelToken) {
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("gamecloud-http".to_string())
            .spawn(move || {
                inner.run_chain(id, request, &cancel);
                inner.settle(id);
            });
        if let Err(e) = spawned {
            error!(request_id = %id, error = %e, "could not spawn dispatch thread");
            let failure = HttpResponse::transport_failure(TransportError::Spawn(e.to_string()));
            self.finish(id, failure);
            self.settle(id);
        }
    }

    fn run_chain(self: &Arc<Self>, id: Uuid, request: HttpRequest, cancel: &CancelToken) {
        let schedule = &self.config.backoff_schedule;
        let mut attempt = 0usize;

        loop {
            if !self.is_active(id) {
                debug!(request_id = %id, attempt, "request aborted before dispatch");
                self.release_slot(id);
                return;
            }

            let shard = pick_shard(request.load_balancer_count);
            let stamped = request.stamped(shard);
            debug!(
                request_id = %id,
                method = stamped.method().as_str(),
                url = %stamped.url,
                attempt,
                "dispatching request"
            );

            let response = self
                .transport
                .execute(&stamped, cancel)
                .unwrap_or_else(HttpResponse::transport_failure);

            // Only now is the aborted call really over.
            if !self.is_active(id) {
                debug!(request_id = %id, "discarding response of aborted request");
                self.release_slot(id);
                return;
            }

            if request.retry_policy.should_retry(&response) {
                if let Some(delay) = schedule.get(attempt) {
                    warn!(
                        request_id = %id,
                        status = response.status,
                        error = ?response.error,
                        retry = attempt + 1,
                        delay_ms = duration_ms(*delay),
                        "request failed, retrying"
                    );
                    cancel.wait_for(*delay);
                    attempt += 1;
                    continue;
                }
                error!(
                    request_id = %id,
                    url = %stamped.url,
                    status = response.status,
                    error = ?response.error,
                    attempts = attempt + 1,
                    "request failed, retries exhausted"
                );
            }

            self.finish(id, response);
            return;
        }
    }

    fn is_active(&self, id: Uuid) -> bool {
        self.state.lock().active.contains_key(&id)
    }

    /// Deliver the final response and hand the slot to the next request.
    fn finish(self: &Arc<Self>, id: Uuid, response: HttpResponse) {
        let taken = {
            let mut state = self.state.lock();
            let managed = state.in_flight == Some(id);
            state.active.remove(&id).map(|callback| (callback, managed))
        };
        let Some((callback, managed)) = taken else {
            // Aborted after the last check.
            self.release_slot(id);
            return;
        };

        let outer = managed.then(|| MANAGED_CALLBACK.with(|c| c.replace(self.key())));
        if catch_unwind(AssertUnwindSafe(|| callback(response))).is_err() {
            error!(request_id = %id, "completion callback panicked");
        }
        if let Some(outer) = outer {
            MANAGED_CALLBACK.with(|c| c.set(outer));
        }
        self.release_slot(id);
    }

    fn settle(&self, id: Uuid) {
        self.state.lock().running.remove(&id);
        self.settled.notify_all();
    }

    fn release_slot(self: &Arc<Self>, id: Uuid) {
        let next = {
            let mut state = self.state.lock();
            if state.in_flight != Some(id) {
                return;
            }
            state.in_flight = None;
            match state.queue.pop_front() {
                Some(queued) => {
                    state.in_flight = Some(queued.id);
                    let cancel = state.dispatch(queued.id, queued.callback);
                    Some((queued.id, queued.request, cancel))
                }
                None => None,
            }
        };
        if let Some((next_id, request, cancel)) = next {
            self.spawn_chain(next_id, request, cancel);
        }
    }
}

/// Uniform shard id in `[1, count]`.
fn pick_shard(count: u32) -> u32 {
    if count <= 1 {
        return 1;
    }
    rand::thread_rng().gen_range(1..=count)
}
