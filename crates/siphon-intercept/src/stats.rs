//! Dispatcher counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running totals across every exchange a dispatcher has seen.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    exchanges: AtomicU64,
    blocked: AtomicU64,
    served_from_cache: AtomicU64,
    revalidated: AtomicU64,
    passed_through: AtomicU64,
    bytes_saved: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub exchanges: u64,
    pub blocked: u64,
    pub served_from_cache: u64,
    pub revalidated: u64,
    pub passed_through: u64,
    pub bytes_saved: u64,
}

impl DispatcherStats {
    pub(crate) fn exchange(&self) {
        self.exchanges.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn served_from_cache(&self) {
        self.served_from_cache.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn revalidated(&self) {
        self.revalidated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn passed_through(&self) {
        self.passed_through.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn saved(&self, bytes: u64) {
        self.bytes_saved.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            exchanges: self.exchanges.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            served_from_cache: self.served_from_cache.load(Ordering::Relaxed),
            revalidated: self.revalidated.load(Ordering::Relaxed),
            passed_through: self.passed_through.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
        }
    }
}
