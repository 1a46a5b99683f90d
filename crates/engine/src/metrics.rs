use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process counters, owned by the server and shared with the Uploader.
#[derive(Debug, Default)]
pub struct Metrics {
    requests_committed: AtomicU64,
    requests_rolled_back: AtomicU64,
    batches_finalized: AtomicU64,
    deferred_changes_merged: AtomicU64,
    resolver_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub requests_committed: u64,
    pub requests_rolled_back: u64,
    pub batches_finalized: u64,
    pub deferred_changes_merged: u64,
    pub resolver_failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn request_committed(&self) {
        self.requests_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_rolled_back(&self) {
        self.requests_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batch_finalized(&self) {
        self.batches_finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn changes_merged(&self, count: u64) {
        self.deferred_changes_merged.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn resolver_failed(&self) {
        self.resolver_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_committed: self.requests_committed.load(Ordering::Relaxed),
            requests_rolled_back: self.requests_rolled_back.load(Ordering::Relaxed),
            batches_finalized: self.batches_finalized.load(Ordering::Relaxed),
            deferred_changes_merged: self.deferred_changes_merged.load(Ordering::Relaxed),
            resolver_failures: self.resolver_failures.load(Ordering::Relaxed),
        }
    }
}
