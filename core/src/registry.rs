//! Process-wide bookkeeping of running event loops, so an application can
//! pause or stop all of them at once when it goes to the background or
//! shuts down.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::event_loop::DomainEventLoop;

/// Loops lock their own state before the registry, never the other way
/// round. Nothing here may read a loop's status while `loops` is held.
#[derive(Default)]
pub struct LoopRegistry {
    loops: Mutex<HashMap<Uuid, DomainEventLoop>>,
}

impl std::fmt::Debug for LoopRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopRegistry")
            .field("loops", &self.loops.lock().len())
            .finish()
    }
}

impl LoopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, event_loop: DomainEventLoop) {
        self.loops.lock().insert(event_loop.id(), event_loop);
    }

    pub(crate) fn unregister(&self, id: Uuid) {
        self.loops.lock().remove(&id);
    }

    /// First registered loop polling `domain`, if any.
    pub fn get(&self, domain: &str) -> Option<DomainEventLoop> {
        self.loops
            .lock()
            .values()
            .find(|l| l.domain() == domain)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.loops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.lock().is_empty()
    }

    pub fn suspend_all(&self) {
        let loops = self.snapshot();
        info!(count = loops.len(), "suspending all event loops");
        for event_loop in loops {
            event_loop.suspend();
        }
    }

    pub fn resume_all(&self) {
        let loops = self.snapshot();
        info!(count = loops.len(), "resuming all event loops");
        for event_loop in loops {
            event_loop.resume();
        }
    }

    /// Stop every loop. Stopped loops remove themselves, so the registry is
    /// empty afterwards.
    pub fn stop_all(&self) {
        let loops = self.snapshot();
        info!(count = loops.len(), "stopping all event loops");
        for event_loop in &loops {
            event_loop.stop();
        }
        for event_loop in loops {
            event_loop.join();
        }
    }

    // Lifecycle calls re-enter the registry, so they run on a copy.
    fn snapshot(&self) -> Vec<DomainEventLoop> {
        self.loops.lock().values().cloned().collect()
    }
}
