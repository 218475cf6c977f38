//! Per-call cancellation shared between the pipeline and a `Transport`.
//!
//! The pipeline keeps the `CancelHandle` of every dispatched request and
//! fires it on `abort`. The transport call and the backoff sleep observe
//! the matching `CancelToken`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

/// Observing side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// A token nobody can cancel, for calls made outside a pipeline.
    pub fn never() -> Self {
        Self {
            state: Arc::new(CancelState::default()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.cancelled.lock()
    }

    /// Sleep for `duration` or until cancelled. Returns true if cancelled.
    pub fn wait_for(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.state.cancelled.lock();
        while !*cancelled {
            if self
                .state
                .signal
                .wait_until(&mut cancelled, deadline)
                .timed_out()
            {
                break;
            }
        }
        *cancelled
    }
}

/// Triggering side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        *self.state.cancelled.lock() = true;
        self.state.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.cancelled.lock()
    }
}

pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = Arc::new(CancelState::default());
    (
        CancelToken {
            state: Arc::clone(&state),
        },
        CancelHandle { state },
    )
}
