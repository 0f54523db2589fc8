//! Configuration of an aggregation cache instance.

use std::collections::BTreeSet;
use std::time::Duration;

use meter_core::{MELEE_DAMAGE_EVENT, SPELL_DAMAGE_EVENT};
use serde::Deserialize;

/// Default number of published results buffered per subscriber.
const DEFAULT_RESULT_BUFFER: usize = 16;

/// Settings for one [`AggregationCache`](crate::AggregationCache).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Event-type codes whose `NewData` batches invalidate the result.
    pub watched_event_types: BTreeSet<u16>,

    /// Upper bound for each data source fetch, in milliseconds.
    ///
    /// `None` waits forever; a fetch that never resolves then keeps the
    /// scheduler busy for good.
    pub fetch_timeout_ms: Option<u64>,

    /// Published results buffered per subscriber before it starts skipping
    /// to newer ones.
    pub result_buffer: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            watched_event_types: [MELEE_DAMAGE_EVENT, SPELL_DAMAGE_EVENT].into(),
            fetch_timeout_ms: None,
            result_buffer: DEFAULT_RESULT_BUFFER,
        }
    }
}

impl CacheConfig {
    /// Replace the watched event-type codes.
    pub fn watched_event_types(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.watched_event_types = codes.into_iter().collect();
        self
    }

    /// Bound every fetch by `timeout`.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the per-subscriber result buffer.
    pub fn result_buffer(mut self, capacity: usize) -> Self {
        self.result_buffer = capacity;
        self
    }

    /// The fetch timeout as a [`Duration`].
    pub fn fetch_timeout_duration(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }
}
