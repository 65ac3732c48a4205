use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

/// In-process counters describing what the dispatcher has seen.
#[derive(Clone, Default)]
pub struct DispatcherStats {
    inner: Arc<RwLock<Counters>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub dequeued: u64,
    pub finished: u64,
    pub exhausted: u64,
    pub dropped_invalid: u64,
}

impl DispatcherStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dequeued(&self) {
        self.inner.write().dequeued += 1;
    }

    pub fn record_finished(&self) {
        self.inner.write().finished += 1;
    }

    pub fn record_exhausted(&self) {
        self.inner.write().exhausted += 1;
    }

    pub fn record_dropped_invalid(&self) {
        self.inner.write().dropped_invalid += 1;
    }

    pub fn snapshot(&self) -> Counters {
        *self.inner.read()
    }
}
