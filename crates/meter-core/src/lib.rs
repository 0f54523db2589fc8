//! Core types for the damage meter.
//!
//! This crate provides the building blocks shared by the aggregation cache
//! and its callers:
//!
//! - **Types**: actor/ability ids, modes, partial aggregates and the merged
//!   [`AggregationResult`]
//! - **Bus**: broadcast channel of [`UpdateBatch`]es
//! - **Sources**: the [`DataSource`], [`MetadataProvider`] and
//!   [`EnrichmentSink`] traits plus in-memory implementations

pub mod bus;
mod error;
pub mod source;
mod types;

pub use bus::{DEFAULT_BUS_CAPACITY, UpdateBus};
pub use error::MeterError;
pub use source::{
    DataSource, EnrichmentRequest, EnrichmentSink, MemorySource, MetadataProvider, NoopSink,
    SharedMetadata, TracingSink,
};
pub use types::*;
