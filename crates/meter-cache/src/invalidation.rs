//! Decides which update batches invalidate a cached table.

use std::collections::BTreeSet;

use meter_core::{UpdateBatch, UpdateKind};

/// Invalidation predicate of one cache.
///
/// A batch invalidates iff it carries `FilterChanged`, or it carries
/// `NewData` together with at least one watched event-type code.
#[derive(Debug, Clone)]
pub struct InvalidationPolicy {
    watched_event_types: BTreeSet<u16>,
}

impl InvalidationPolicy {
    pub fn new(watched_event_types: BTreeSet<u16>) -> Self {
        Self {
            watched_event_types,
        }
    }

    /// Whether `batch` requires a recompute.
    pub fn invalidates(&self, batch: &UpdateBatch) -> bool {
        if batch.has_kind(UpdateKind::FilterChanged) {
            return true;
        }
        batch.has_kind(UpdateKind::NewData)
            && batch
                .event_types
                .iter()
                .any(|code| self.watched_event_types.contains(code))
    }
}
