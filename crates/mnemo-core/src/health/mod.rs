//! Component readiness tracking.
//!
//! Each long-lived component flips its flag as it comes up or goes down;
//! the serve router exposes the snapshot on the probe endpoints, and
//! admission refuses new work until the store is open.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// Shared readiness flags.
#[derive(Debug, Default)]
pub struct Readiness {
    store_open: AtomicBool,
    hub_listening: AtomicBool,
    dispatcher_running: AtomicBool,
}

/// Point-in-time readiness view, serialized on the probe endpoints.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthReport {
    pub store_open: bool,
    pub hub_listening: bool,
    pub dispatcher_running: bool,
    pub ready: bool,
}

impl Readiness {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_store_open(&self, open: bool) {
        self.store_open.store(open, Ordering::Relaxed);
    }

    pub fn set_hub_listening(&self, listening: bool) {
        self.hub_listening.store(listening, Ordering::Relaxed);
    }

    pub fn set_dispatcher_running(&self, running: bool) {
        self.dispatcher_running.store(running, Ordering::Relaxed);
    }

    /// Whether enqueue should accept new work.
    pub fn accepting_work(&self) -> bool {
        self.store_open.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> HealthReport {
        let store_open = self.store_open.load(Ordering::Relaxed);
        let hub_listening = self.hub_listening.load(Ordering::Relaxed);
        let dispatcher_running = self.dispatcher_running.load(Ordering::Relaxed);
        HealthReport {
            store_open,
            hub_listening,
            dispatcher_running,
            ready: store_open && hub_listening && dispatcher_running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_requires_all_components() {
        let readiness = Readiness::new();
        assert!(!readiness.report().ready);
        readiness.set_store_open(true);
        readiness.set_hub_listening(true);
        assert!(!readiness.report().ready);
        readiness.set_dispatcher_running(true);
        assert!(readiness.report().ready);
        assert!(readiness.accepting_work());
        readiness.set_store_open(false);
        assert!(!readiness.accepting_work());
        assert!(!readiness.report().ready);
    }
}
