//! Collaborator traits consumed by the aggregation cache, with in-memory
//! implementations.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::{AbilityId, MeterError, Mode, PartialAggregate, TimeWindow, Unit};

/// Provider of one partial aggregate (e.g. melee or spell damage).
///
/// `fetch` must return everything currently known for `mode`, not a delta.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Fetch the partial aggregate for `mode`.
    async fn fetch(&self, mode: Mode) -> Result<PartialAggregate, MeterError>;
}

/// Read-only view of the instance metadata.
pub trait MetadataProvider: Send + Sync {
    /// The active time window, or `None` while metadata is not loaded.
    fn current_window(&self) -> Option<TimeWindow>;
}

/// A request to make metadata for a unit or ability available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentRequest {
    /// Resolve basic information about a unit as of timestamp `at`.
    Unit { unit: Unit, at: Option<u64> },
    /// Resolve basic information about an ability.
    Ability { ability: AbilityId },
}

/// Receiver of enrichment requests. Callers never await the outcome.
#[async_trait]
pub trait EnrichmentSink: Send + Sync {
    async fn request(&self, request: EnrichmentRequest) -> Result<(), MeterError>;
}

/// In-memory data source holding one partial aggregate per mode.
pub struct MemorySource {
    name: String,
    data: DashMap<Mode, PartialAggregate>,
    /// Number of upcoming fetches that fail.
    failures_pending: AtomicUsize,
    fetches: AtomicU64,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: DashMap::new(),
            failures_pending: AtomicUsize::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    /// Replace the data served for `mode`.
    pub fn set(&self, mode: Mode, partial: PartialAggregate) {
        debug!(source = %self.name, mode = %mode, actors = partial.len(), "replacing source data");
        self.data.insert(mode, partial);
    }

    /// Builder-style variant of [`MemorySource::set`].
    pub fn with_data(self, mode: Mode, partial: PartialAggregate) -> Self {
        self.set(mode, partial);
        self
    }

    /// Make the next fetch fail.
    pub fn fail_next(&self) {
        self.failures_pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of fetches served (successful or not).
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DataSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, mode: Mode) -> Result<PartialAggregate, MeterError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(MeterError::source_failed(&self.name, "injected failure"));
        }
        let partial = self
            .data
            .get(&mode)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        trace!(source = %self.name, mode = %mode, actors = partial.len(), "served fetch");
        Ok(partial)
    }
}

/// Settable metadata provider.
#[derive(Default)]
pub struct SharedMetadata {
    window: RwLock<Option<TimeWindow>>,
}

impl SharedMetadata {
    /// Metadata that is not loaded yet.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Metadata with a loaded window.
    pub fn with_window(window: TimeWindow) -> Self {
        Self {
            window: RwLock::new(Some(window)),
        }
    }

    /// Replace (or clear) the active window.
    pub fn set_window(&self, window: Option<TimeWindow>) {
        *self.window.write().unwrap_or_else(PoisonError::into_inner) = window;
    }
}

impl MetadataProvider for SharedMetadata {
    fn current_window(&self) -> Option<TimeWindow> {
        *self.window.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sink that only logs requests.
pub struct TracingSink;

#[async_trait]
impl EnrichmentSink for TracingSink {
    async fn request(&self, request: EnrichmentRequest) -> Result<(), MeterError> {
        match request {
            EnrichmentRequest::Unit { unit, at } => {
                debug!(unit_id = unit.unit_id, is_player = unit.is_player, at = ?at, "unit enrichment requested");
            }
            EnrichmentRequest::Ability { ability } => {
                debug!(ability = %ability, "ability enrichment requested");
            }
        }
        Ok(())
    }
}

/// Sink that drops every request.
pub struct NoopSink;

#[async_trait]
impl EnrichmentSink for NoopSink {
    async fn request(&self, _request: EnrichmentRequest) -> Result<(), MeterError> {
        Ok(())
    }
}
