//! Incremental aggregation cache for the damage meter.
//!
//! This crate provides:
//! - Merging of melee and spell partial aggregates into one table
//! - Invalidation of the table from update-bus batches
//! - A scheduler that keeps at most one recompute in flight and coalesces
//!   invalidations into a single follow-up
//! - Replay-latest publishing of results to subscribers

pub mod cache;
mod channel;
mod config;
mod coordinator;
mod error;
mod invalidation;
pub mod merge;
mod stats;

pub use cache::{AggregationCache, AggregationCacheBuilder};
pub use channel::AggregationStream;
pub use config::CacheConfig;
pub use error::CacheError;
pub use invalidation::InvalidationPolicy;
pub use merge::{MergeOutput, merge};
pub use stats::StatsSnapshot;
