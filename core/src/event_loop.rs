//! Long-poll event loop for one gamer and one domain.
//!
//! # Design
//! Each loop owns a dedicated worker thread that runs a blocking sequence:
//! build the poll, submit it through the pipeline with the bypass flag, and
//! block on a channel until the callback delivers the response. Lifecycle
//! calls (`suspend`, `resume`, `stop`) come from other threads. They flip
//! the status under the state mutex, wake the worker through the condvar,
//! and abort the in-flight poll. An aborted poll drops its callback, which
//! closes the channel and unblocks the worker at once.
//!
//! An aborted poll may still hold a connection if the transport cannot
//! cancel it. The worker does not issue the next poll before the pipeline
//! reports the aborted one settled, so at most one poll per loop is open.
//!
//! The acknowledgement token is a local of the worker, so nothing outside
//! the loop can change it. It only changes when a 200 delivers a message.
//! Pausing, aborts and failures keep it as it was.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::CloudClient;
use crate::config::EventLoopConfig;
use crate::error::LoopError;
use crate::http::duration_ms;
use crate::pipeline::{RequestHandle, RequestPipeline};
use crate::registry::LoopRegistry;
use crate::types::{DomainEvent, GamerCredentials};

// How often a worker waiting for an aborted poll checks for `stop`.
const SETTLE_CHECK: Duration = Duration::from_millis(50);

/// Lifecycle of a `DomainEventLoop`. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    NotStarted,
    Running,
    Paused,
    Stopped,
}

pub type Listener = Arc<dyn Fn(&DomainEvent) + Send + Sync + 'static>;

/// Handle to a long-poll event loop. Clones control the same loop.
///
/// Once started, the worker keeps polling until `stop` is called or the
/// server answers with a 4xx, even if every handle is dropped.
#[derive(Clone)]
pub struct DomainEventLoop {
    shared: Arc<Shared>,
}

struct Shared {
    id: Uuid,
    domain: String,
    gamer: GamerCredentials,
    client: CloudClient,
    pipeline: RequestPipeline,
    timing: EventLoopConfig,
    state: Mutex<LoopState>,
    wake: Condvar,
    listeners: RwLock<Vec<Listener>>,
    registry: OnceLock<Weak<LoopRegistry>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct LoopState {
    status: LoopStatus,
    in_flight: Option<RequestHandle>,
}

impl DomainEventLoop {
    pub fn new(
        client: CloudClient,
        pipeline: RequestPipeline,
        gamer: GamerCredentials,
        domain: &str,
        timing: EventLoopConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                domain: domain.to_string(),
                gamer,
                client,
                pipeline,
                timing,
                state: Mutex::new(LoopState {
                    status: LoopStatus::NotStarted,
                    in_flight: None,
                }),
                wake: Condvar::new(),
                listeners: RwLock::new(Vec::new()),
                registry: OnceLock::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Track this loop in `registry` while it runs. Only the first registry
    /// given to a loop is kept.
    pub fn with_registry(self, registry: &Arc<LoopRegistry>) -> Self {
        let _ = self.shared.registry.set(Arc::downgrade(registry));
        self
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn domain(&self) -> &str {
        &self.shared.domain
    }

    pub fn status(&self) -> LoopStatus {
        self.shared.state.lock().status
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.write().push(Arc::new(listener));
    }

    pub fn clear_listeners(&self) {
        self.shared.listeners.write().clear();
    }

    /// Start polling. A no-op on a loop that is already running or paused.
    pub fn start(&self) -> Result<(), LoopError> {
        let mut state = self.shared.state.lock();
        match state.status {
            LoopStatus::Running | LoopStatus::Paused => return Ok(()),
            LoopStatus::Stopped => {
                return Err(LoopError::InvalidState {
                    status: LoopStatus::Stopped,
                })
            }
            LoopStatus::NotStarted => {}
        }

        // The worker blocks on the state lock until the loop is marked
        // running and registered, so it cannot unregister before that.
        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name(format!("gamecloud-loop-{}", self.shared.domain))
            .spawn(move || shared.run())
            .map_err(|e| LoopError::Spawn(e.to_string()))?;
        state.status = LoopStatus::Running;
        *self.shared.worker.lock() = Some(worker);
        if let Some(registry) = self.shared.registry() {
            registry.register(self.clone());
        }
        drop(state);

        info!(domain = %self.shared.domain, loop_id = %self.shared.id, "event loop started");
        Ok(())
    }

    /// Pause polling. The in-flight poll is aborted; the pending
    /// acknowledgement is sent with the first poll after `resume`.
    pub fn suspend(&self) {
        let in_flight = {
            let mut state = self.shared.state.lock();
            if state.status != LoopStatus::Running {
                return;
            }
            state.status = LoopStatus::Paused;
            state.in_flight.take()
        };
        self.shared.wake.notify_all();
        if let Some(handle) = in_flight {
            self.shared.pipeline.abort(&handle);
        }
        info!(domain = %self.shared.domain, "event loop suspended");
    }

    pub fn resume(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.status != LoopStatus::Paused {
                return;
            }
            state.status = LoopStatus::Running;
        }
        self.shared.wake.notify_all();
        info!(domain = %self.shared.domain, "event loop resumed");
    }

    /// Stop for good: wake the worker, abort its poll and leave the
    /// registry. The loop cannot be started again.
    pub fn stop(&self) {
        self.shared.halt();
    }

    /// Wait for the worker thread to exit. Returns false if there is no
    /// worker to wait for, or when called from the worker itself.
    pub fn join(&self) -> bool {
        let Some(worker) = self.shared.worker.lock().take() else {
            return false;
        };
        if worker.thread().id() == thread::current().id() {
            *self.shared.worker.lock() = Some(worker);
            return false;
        }
        worker.join().is_ok()
    }
}

impl std::fmt::Debug for DomainEventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainEventLoop")
            .field("id", &self.shared.id)
            .field("domain", &self.shared.domain)
            .field("status", &self.status())
            .finish()
    }
}

impl Shared {
    fn registry(&self) -> Option<Arc<LoopRegistry>> {
        self.registry.get().and_then(Weak::upgrade)
    }

    fn halt(&self) {
        let in_flight = {
            let mut state = self.state.lock();
            if state.status == LoopStatus::Stopped {
                return;
            }
            state.status = LoopStatus::Stopped;
            state.in_flight.take()
        };
        self.wake.notify_all();
        if let Some(handle) = in_flight {
            self.pipeline.abort(&handle);
        }
        if let Some(registry) = self.registry() {
            registry.unregister(self.id);
        }
        info!(domain = %self.domain, loop_id = %self.id, "event loop stopped");
    }

    fn run(self: Arc<Self>) {
        let mut ack: Option<String> = None;
        let mut failed = false;
        let mut aborted: Option<RequestHandle> = None;

        loop {
            if let Some(previous) = aborted.take() {
                self.await_settled(&previous);
            }

            if failed {
                let mut state = self.state.lock();
                if state.status == LoopStatus::Running {
                    debug!(
                        domain = %self.domain,
                        cooldown_ms = duration_ms(self.timing.failure_cooldown),
                        "cooling down after failed poll"
                    );
                    self.wake.wait_for(&mut state, self.timing.failure_cooldown);
                }
            }

            let (received, handle) = {
                let mut state = self.state.lock();
                while state.status == LoopStatus::Paused {
                    self.wake.wait(&mut state);
                    failed = false;
                }
                if state.status == LoopStatus::Stopped {
                    break;
                }

                let request = self.client.build_event_poll(
                    &self.gamer,
                    &self.domain,
                    &self.timing,
                    ack.as_deref(),
                );
                debug!(domain = %self.domain, ack = ?ack, "polling for events");
                let (tx, rx) = mpsc::sync_channel(1);
                let handle = self.pipeline.submit(request, move |response| {
                    let _ = tx.send(response);
                });
                state.in_flight = Some(handle);
                (rx, handle)
            };

            let outcome = received.recv();
            self.state.lock().in_flight = None;
            let Ok(response) = outcome else {
                debug!(domain = %self.domain, request_id = %handle.id(), "poll aborted");
                aborted = Some(handle);
                continue;
            };

            match self.client.parse_event_poll(&self.domain, &response) {
                Ok(Some(event)) => {
                    failed = false;
                    ack = event.id().map(str::to_string);
                    debug!(domain = %self.domain, event_id = ?ack, event_type = event.event_type(), "event received");
                    self.dispatch(&event);
                }
                Ok(None) => {
                    failed = false;
                }
                Err(e) if e.is_client_error() => {
                    error!(domain = %self.domain, error = %e, "poll rejected, stopping event loop");
                    self.halt();
                    break;
                }
                Err(e) => {
                    warn!(domain = %self.domain, error = %e, "poll failed");
                    failed = true;
                }
            }
        }

        debug!(domain = %self.domain, loop_id = %self.id, "event loop worker exited");
    }

    /// Block until the aborted poll's transport call has returned, or the
    /// loop was stopped.
    fn await_settled(&self, previous: &RequestHandle) {
        while !self.pipeline.wait_settled(previous, SETTLE_CHECK) {
            if self.state.lock().status == LoopStatus::Stopped {
                return;
            }
            debug!(domain = %self.domain, request_id = %previous.id(), "waiting for aborted poll to return");
        }
    }

    fn dispatch(&self, event: &DomainEvent) {
        let listeners = self.listeners.read().clone();
        if listeners.is_empty() {
            debug!(domain = %self.domain, "no listener registered, event dropped");
        }
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(
                    domain = %self.domain,
                    event_id = ?event.id(),
                    "event listener panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, PipelineConfig};
    use crate::test_utils::ScriptedTransport;
    use crate::types::DEFAULT_DOMAIN;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(2);

    fn timing() -> EventLoopConfig {
        EventLoopConfig {
            long_poll_timeout: Duration::from_secs(1),
            failure_cooldown: Duration::from_millis(20),
            request_grace: Duration::from_secs(1),
        }
    }

    fn event_loop(transport: &Arc<ScriptedTransport>) -> DomainEventLoop {
        event_loop_with(transport, timing())
    }

    fn event_loop_with(transport: &Arc<ScriptedTransport>, timing: EventLoopConfig) -> DomainEventLoop {
        let client = CloudClient::new(ClientConfig::new("key", "secret", "http://api.test"));
        let pipeline = RequestPipeline::new(Arc::clone(transport), PipelineConfig::no_retries());
        DomainEventLoop::new(
            client,
            pipeline,
            GamerCredentials::new("g1", "s1"),
            DEFAULT_DOMAIN,
            timing,
        )
    }

    fn collect_events(event_loop: &DomainEventLoop) -> mpsc::Receiver<DomainEvent> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        event_loop.add_listener(move |event| {
            let _ = tx.lock().send(event.clone());
        });
        rx
    }

    fn wait_for_status(event_loop: &DomainEventLoop, status: LoopStatus) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if event_loop.status() == status {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn ack_of(request: &crate::http::HttpRequest) -> Option<String> {
        request
            .url
            .split_once("&ack=")
            .map(|(_, ack)| ack.to_string())
    }

    #[test]
    fn delivers_event_and_acknowledges_it_on_next_poll() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);
        let events = collect_events(&event_loop);
        transport.push(200, r#"{"id":"m1","type":"godchild"}"#);

        event_loop.start().unwrap();
        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.id(), Some("m1"));
        assert_eq!(event.event_type(), "godchild");

        assert!(transport.wait_for_requests(2, WAIT));
        let requests = transport.requests();
        assert_eq!(ack_of(&requests[0]), None);
        assert_eq!(ack_of(&requests[1]).as_deref(), Some("m1"));
        assert!(requests[1].url.starts_with("http://api.test/v1/gamer/event/private?timeout=1000"));
        assert!(requests[1].bypass_queue);

        event_loop.stop();
        assert!(event_loop.join());
    }

    #[test]
    fn no_content_polls_never_send_an_ack() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);
        let events = collect_events(&event_loop);
        for _ in 0..3 {
            transport.push(204, "");
        }

        event_loop.start().unwrap();
        assert!(transport.wait_for_requests(4, WAIT));
        assert!(transport.requests().iter().all(|r| ack_of(r).is_none()));
        assert!(events.try_recv().is_err());

        event_loop.stop();
        assert!(event_loop.join());
    }

    #[test]
    fn ack_carries_over_no_content_polls() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);
        transport.push(200, r#"{"id":"m1","type":"godchild"}"#);
        transport.push(204, "");
        transport.push(204, "");

        event_loop.start().unwrap();
        assert!(transport.wait_for_requests(4, WAIT));
        let acks: Vec<Option<String>> = transport.requests().iter().map(ack_of).collect();
        assert_eq!(acks[0], None);
        for ack in &acks[1..4] {
            assert_eq!(ack.as_deref(), Some("m1"));
        }

        event_loop.stop();
    }

    #[test]
    fn client_error_stops_the_loop() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);
        transport.push(403, "forbidden");

        event_loop.start().unwrap();
        assert!(wait_for_status(&event_loop, LoopStatus::Stopped));
        assert!(event_loop.join());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(transport.request_count(), 1);
        assert!(matches!(event_loop.start(), Err(LoopError::InvalidState { .. })));
    }

    #[test]
    fn server_errors_keep_the_loop_alive() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);
        let events = collect_events(&event_loop);
        transport.push(503, "");
        transport.push_failure(crate::error::TransportError::Connection("reset".to_string()));
        transport.push(200, r#"{"id":"m2","type":"friend"}"#);

        event_loop.start().unwrap();
        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.id(), Some("m2"));
        assert_eq!(event_loop.status(), LoopStatus::Running);
        assert!(transport.request_count() >= 3);

        event_loop.stop();
    }

    #[test]
    fn panicking_listener_does_not_kill_the_loop() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);
        event_loop.add_listener(|_| panic!("listener bug"));
        let events = collect_events(&event_loop);
        transport.push(200, r#"{"id":"m1","type":"a"}"#);
        transport.push(200, r#"{"id":"m2","type":"b"}"#);

        event_loop.start().unwrap();
        assert_eq!(events.recv_timeout(WAIT).unwrap().id(), Some("m1"));
        assert_eq!(events.recv_timeout(WAIT).unwrap().id(), Some("m2"));
        assert_eq!(event_loop.status(), LoopStatus::Running);

        event_loop.stop();
    }

    #[test]
    fn suspend_and_resume_keep_the_pending_ack() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);
        let events = collect_events(&event_loop);
        transport.push(200, r#"{"id":"m1","type":"godchild"}"#);

        event_loop.start().unwrap();
        events.recv_timeout(WAIT).unwrap();
        assert!(transport.wait_for_requests(2, WAIT));

        event_loop.suspend();
        assert_eq!(event_loop.status(), LoopStatus::Paused);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(transport.request_count(), 2);

        event_loop.resume();
        assert_eq!(event_loop.status(), LoopStatus::Running);
        assert!(transport.wait_for_requests(3, WAIT));
        let requests = transport.requests();
        assert_eq!(ack_of(&requests[2]).as_deref(), Some("m1"));

        event_loop.stop();
    }

    #[test]
    fn start_after_stop_is_an_invalid_state() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);

        event_loop.stop();
        assert_eq!(event_loop.status(), LoopStatus::Stopped);
        let err = event_loop.start().unwrap_err();
        assert_eq!(
            err,
            LoopError::InvalidState {
                status: LoopStatus::Stopped
            }
        );
        thread::sleep(Duration::from_millis(20));
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn starting_twice_is_a_no_op() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);

        event_loop.start().unwrap();
        event_loop.start().unwrap();
        assert!(transport.wait_for_requests(1, WAIT));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(transport.request_count(), 1);

        event_loop.stop();
    }

    #[test]
    fn stop_unblocks_a_pending_poll_promptly() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);

        event_loop.start().unwrap();
        assert!(transport.wait_for_requests(1, WAIT));

        let started = Instant::now();
        event_loop.stop();
        assert!(event_loop.join());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!event_loop.join());
    }

    #[test]
    fn lifecycle_calls_out_of_order_are_ignored() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);

        event_loop.resume();
        event_loop.suspend();
        assert_eq!(event_loop.status(), LoopStatus::NotStarted);
        event_loop.stop();
        event_loop.stop();
        assert_eq!(event_loop.status(), LoopStatus::Stopped);
    }

    fn gaps(times: &[Instant]) -> Vec<Duration> {
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[test]
    fn polls_use_the_default_domain_route() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);
        assert_eq!(event_loop.domain(), DEFAULT_DOMAIN);

        event_loop.start().unwrap();
        assert!(transport.wait_for_requests(1, WAIT));
        assert!(transport.requests()[0]
            .url
            .starts_with(&format!("http://api.test/v1/gamer/event/{DEFAULT_DOMAIN}?")));

        event_loop.stop();
        assert!(event_loop.join());
    }

    #[test]
    fn cleared_listeners_receive_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);
        let dropped = collect_events(&event_loop);
        event_loop.clear_listeners();
        let kept = collect_events(&event_loop);
        transport.push(200, r#"{"id":"m1","type":"godchild"}"#);

        event_loop.start().unwrap();
        assert_eq!(kept.recv_timeout(WAIT).unwrap().id(), Some("m1"));
        assert!(dropped.try_recv().is_err());

        // The event still moves the ack without any listener.
        event_loop.clear_listeners();
        transport.push(200, r#"{"id":"m2","type":"godchild"}"#);
        assert!(transport.wait_for_requests(3, WAIT));
        assert_eq!(ack_of(&transport.requests()[2]).as_deref(), Some("m2"));
        assert!(kept.try_recv().is_err());

        event_loop.stop();
    }

    #[test]
    fn only_failures_wait_for_the_cooldown() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop_with(
            &transport,
            EventLoopConfig {
                failure_cooldown: Duration::from_millis(200),
                ..timing()
            },
        );
        transport.push(503, "");
        transport.push(204, "");
        transport.push(200, r#"{"id":"m1","type":"a"}"#);

        event_loop.start().unwrap();
        assert!(transport.wait_for_requests(4, WAIT));
        let gaps = gaps(&transport.request_times());
        assert!(gaps[0] >= Duration::from_millis(200), "after 503: {:?}", gaps[0]);
        assert!(gaps[1] < Duration::from_millis(150), "after 204: {:?}", gaps[1]);
        assert!(gaps[2] < Duration::from_millis(150), "after 200: {:?}", gaps[2]);

        event_loop.stop();
        assert!(event_loop.join());
    }

    #[test]
    fn resume_skips_the_pending_cooldown() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop_with(
            &transport,
            EventLoopConfig {
                failure_cooldown: Duration::from_secs(2),
                ..timing()
            },
        );
        transport.push(500, "");

        event_loop.start().unwrap();
        assert!(transport.wait_for_requests(1, WAIT));
        thread::sleep(Duration::from_millis(50));

        event_loop.suspend();
        event_loop.resume();
        let resumed = Instant::now();
        assert!(transport.wait_for_requests(2, WAIT));
        assert!(resumed.elapsed() < Duration::from_secs(1));

        event_loop.stop();
        assert!(event_loop.join());
    }

    fn cycle_suspend_resume(transport: &Arc<ScriptedTransport>, event_loop: &DomainEventLoop) {
        event_loop.start().unwrap();
        for polls in 1..=4 {
            assert!(transport.wait_for_requests(polls, WAIT));
            event_loop.suspend();
            thread::sleep(Duration::from_millis(10));
            event_loop.resume();
        }
        assert!(transport.wait_for_requests(5, WAIT));
        assert_eq!(transport.max_in_flight(), 1);

        event_loop.stop();
        assert!(event_loop.join());
    }

    #[test]
    fn suspend_resume_cycles_keep_one_poll_open() {
        let transport = Arc::new(ScriptedTransport::new());
        let event_loop = event_loop(&transport);
        cycle_suspend_resume(&transport, &event_loop);
    }

    #[test]
    fn uncancellable_poll_is_waited_out_before_the_next() {
        let transport = Arc::new(ScriptedTransport::ignoring_cancellation());
        let event_loop = event_loop_with(
            &transport,
            EventLoopConfig {
                long_poll_timeout: Duration::from_millis(200),
                failure_cooldown: Duration::from_millis(20),
                request_grace: Duration::from_millis(100),
            },
        );
        cycle_suspend_resume(&transport, &event_loop);
    }
}
