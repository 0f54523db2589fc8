//! Error types for the aggregation cache.

use thiserror::Error;

/// Errors that can end a recompute or a cache operation.
///
/// None of these ever reach subscribers; a failed recompute simply leaves the
/// last published result in place.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A data source fetch failed.
    #[error("fetch from {source_name} failed: {error}")]
    Fetch {
        source_name: String,
        error: meter_core::MeterError,
    },

    /// A data source fetch did not finish in time.
    #[error("fetch from {source_name} timed out after {after_ms}ms")]
    Timeout { source_name: String, after_ms: u64 },

    /// A data source or the merge panicked during a recompute.
    #[error("recompute panicked")]
    Panicked,

    /// The scheduler is gone (cache shut down).
    #[error("cache scheduler channel closed")]
    ChannelClosed,
}
