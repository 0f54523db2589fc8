//! Counters describing what a cache's scheduler has done.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// Live counters, written by the scheduler only.
#[derive(Default)]
pub(crate) struct CacheStats {
    pub(crate) batches_received: AtomicU64,
    pub(crate) batches_ignored: AtomicU64,
    pub(crate) invalidations: AtomicU64,
    pub(crate) mode_switches: AtomicU64,
    pub(crate) listener_lags: AtomicU64,
    pub(crate) batches_missed: AtomicU64,
    pub(crate) recomputes_started: AtomicU64,
    pub(crate) recomputes_published: AtomicU64,
    pub(crate) recomputes_failed: AtomicU64,
    pub(crate) recomputes_skipped: AtomicU64,
    pub(crate) reruns_requested: AtomicU64,
    pub(crate) follow_ups_started: AtomicU64,
    pub(crate) generation: AtomicU64,
    pub(crate) in_flight: AtomicBool,
}

impl CacheStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::SeqCst);
        StatsSnapshot {
            batches_received: load(&self.batches_received),
            batches_ignored: load(&self.batches_ignored),
            invalidations: load(&self.invalidations),
            mode_switches: load(&self.mode_switches),
            listener_lags: load(&self.listener_lags),
            batches_missed: load(&self.batches_missed),
            recomputes_started: load(&self.recomputes_started),
            recomputes_published: load(&self.recomputes_published),
            recomputes_failed: load(&self.recomputes_failed),
            recomputes_skipped: load(&self.recomputes_skipped),
            reruns_requested: load(&self.reruns_requested),
            follow_ups_started: load(&self.follow_ups_started),
            generation: load(&self.generation),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of the scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Update batches that reached the scheduler.
    pub batches_received: u64,
    /// Batches that did not invalidate (or arrived before initialization).
    pub batches_ignored: u64,
    /// Batches that invalidated the result.
    pub invalidations: u64,
    pub mode_switches: u64,
    /// Times the bus listener fell behind and forced an invalidation.
    pub listener_lags: u64,
    /// Batches the bus listener never saw because it lagged.
    pub batches_missed: u64,
    pub recomputes_started: u64,
    pub recomputes_published: u64,
    pub recomputes_failed: u64,
    /// Recomputes skipped because metadata was not loaded.
    pub recomputes_skipped: u64,
    /// Invalidations that arrived while a recompute was in flight.
    pub reruns_requested: u64,
    /// Coalesced follow-up recomputes actually started.
    pub follow_ups_started: u64,
    /// Generation of the last published result (0 before the first).
    pub generation: u64,
    pub in_flight: bool,
}
