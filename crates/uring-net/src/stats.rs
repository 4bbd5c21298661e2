//! Loop counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a listener's loop counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    /// Completions drained from the ring.
    pub completions: u64,
    /// Completions whose id was not registered.
    pub stale: u64,
    pub accepted: u64,
    /// Accept calls that failed with something other than would-block.
    pub accept_errors: u64,
    /// Listener re-arms delayed because accepts ran out of resources.
    pub accept_backoffs: u64,
    pub listener_rearms: u64,
    /// Reads that returned data.
    pub reads: u64,
    /// Times a connection was parked on a full inbound queue.
    pub parked: u64,
    /// Completions the kernel dropped on a full CQ.
    pub cq_overflow: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub completions: AtomicU64,
    pub stale: AtomicU64,
    pub accepted: AtomicU64,
    pub accept_errors: AtomicU64,
    pub accept_backoffs: AtomicU64,
    pub listener_rearms: AtomicU64,
    pub reads: AtomicU64,
    pub parked: AtomicU64,
    pub cq_overflow: AtomicU64,
}

impl StatsCounters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LoopStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LoopStats {
            completions: get(&self.completions),
            stale: get(&self.stale),
            accepted: get(&self.accepted),
            accept_errors: get(&self.accept_errors),
            accept_backoffs: get(&self.accept_backoffs),
            listener_rearms: get(&self.listener_rearms),
            reads: get(&self.reads),
            parked: get(&self.parked),
            cq_overflow: get(&self.cq_overflow),
        }
    }
}
