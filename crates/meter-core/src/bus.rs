//! Broadcast bus for update notifications.
//!
//! Producers (log ingestion, the filter UI) publish [`UpdateBatch`]es; every
//! cache that wants to stay fresh subscribes and decides for itself whether
//! a batch invalidates its result.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::trace;

use crate::UpdateBatch;

/// Default broadcast channel capacity for update batches.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Fan-out channel of update batches.
pub struct UpdateBus {
    updates_tx: broadcast::Sender<UpdateBatch>,
    /// Number of batches published so far (delivered or not).
    published: AtomicU64,
}

impl UpdateBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a bus with a specific capacity.
    ///
    /// Subscribers falling more than `capacity` batches behind observe a lag.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            updates_tx,
            published: AtomicU64::new(0),
        })
    }

    /// Subscribe to update batches.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateBatch> {
        self.updates_tx.subscribe()
    }

    /// Publish a batch to all current subscribers.
    pub fn publish(&self, batch: UpdateBatch) {
        self.published.fetch_add(1, Ordering::SeqCst);
        if self.updates_tx.send(batch).is_err() {
            trace!("no subscribers for update batch");
        }
    }

    /// Number of batches published so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}
