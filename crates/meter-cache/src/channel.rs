//! Replay-latest publish channel.
//!
//! A single broadcast channel per cache plus a slot holding the most recent
//! result. Publishing and subscribing take the same lock, so a new
//! subscriber's snapshot and its live feed neither overlap nor leave a gap.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::stream::Stream;
use meter_core::AggregationResult;
use tokio::sync::broadcast;
use tracing::{debug, trace};

struct Slot {
    latest: Option<Arc<AggregationResult>>,
    /// `None` once the cache has shut down.
    results_tx: Option<broadcast::Sender<Arc<AggregationResult>>>,
}

/// Publish side, owned by the cache.
pub(crate) struct ResultChannel {
    slot: Mutex<Slot>,
}

impl ResultChannel {
    pub(crate) fn new(buffer: usize) -> Self {
        let (results_tx, _) = broadcast::channel(buffer.max(1));
        Self {
            slot: Mutex::new(Slot {
                latest: None,
                results_tx: Some(results_tx),
            }),
        }
    }

    /// Replace the latest result and push it to every subscriber.
    pub(crate) fn publish(&self, result: Arc<AggregationResult>) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.latest = Some(Arc::clone(&result));
        let Some(results_tx) = &slot.results_tx else {
            trace!("result channel closed, keeping result as latest only");
            return;
        };
        if results_tx.send(result).is_err() {
            trace!("no live subscribers for published result");
        }
    }

    /// End every live subscription. Later subscribers still get the latest
    /// result, then their stream ends.
    pub(crate) fn close(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.results_tx.take().is_some() {
            debug!("result channel closed");
        }
    }

    pub(crate) fn subscribe(&self) -> AggregationStream {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        AggregationStream {
            pending: slot.latest.clone(),
            results_rx: slot.results_tx.as_ref().map(broadcast::Sender::subscribe),
            last_generation: None,
        }
    }

    pub(crate) fn latest(&self) -> Option<Arc<AggregationResult>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
            .clone()
    }
}

/// Subscriber handle returned by
/// [`AggregationCache::get_data`](crate::AggregationCache::get_data).
///
/// Yields the latest result at subscription time (if any), then every later
/// publish in order. Generations are strictly increasing: a subscriber that
/// falls behind skips to newer results and never sees an older one.
pub struct AggregationStream {
    pending: Option<Arc<AggregationResult>>,
    results_rx: Option<broadcast::Receiver<Arc<AggregationResult>>>,
    last_generation: Option<u64>,
}

impl AggregationStream {
    /// Wait for the next result.
    ///
    /// Returns `None` once unsubscribed or after the cache has shut down.
    pub async fn next(&mut self) -> Option<Arc<AggregationResult>> {
        if let Some(result) = self.pending.take() {
            return Some(self.observe(result));
        }
        loop {
            let rx = self.results_rx.as_mut()?;
            match rx.recv().await {
                Ok(result) => {
                    if self.is_newer(&result) {
                        return Some(self.observe(result));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "result subscriber lagged, skipping to newer results");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.results_rx = None;
                    return None;
                }
            }
        }
    }

    /// Take the next result if one is ready, without waiting.
    pub fn try_next(&mut self) -> Option<Arc<AggregationResult>> {
        if let Some(result) = self.pending.take() {
            return Some(self.observe(result));
        }
        loop {
            let rx = self.results_rx.as_mut()?;
            match rx.try_recv() {
                Ok(result) => {
                    if self.is_newer(&result) {
                        return Some(self.observe(result));
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "result subscriber lagged, skipping to newer results");
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.results_rx = None;
                    return None;
                }
            }
        }
    }

    /// Generation of the last result handed out, if any.
    pub fn last_generation(&self) -> Option<u64> {
        self.last_generation
    }

    /// Stop receiving results. Calling it again is a no-op.
    pub fn unsubscribe(&mut self) {
        self.pending = None;
        self.results_rx = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.results_rx.is_some()
    }

    /// Adapt into a [`Stream`] of results.
    pub fn into_stream(self) -> impl Stream<Item = Arc<AggregationResult>> {
        futures_util::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|result| (result, stream))
        })
    }

    fn is_newer(&self, result: &AggregationResult) -> bool {
        self.last_generation.is_none_or(|last| result.generation > last)
    }

    fn observe(&mut self, result: Arc<AggregationResult>) -> Arc<AggregationResult> {
        self.last_generation = Some(result.generation);
        result
    }
}
