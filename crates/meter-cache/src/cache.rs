//! Public handle of the aggregation cache.
//!
//! The handle is cheap to clone. All mutation happens inside the scheduler
//! task; the handle only enqueues operations and reads the publish channel.

use std::sync::Arc;

use meter_core::{
    AggregationResult, DataSource, EnrichmentSink, MetadataProvider, Mode, TracingSink,
    UpdateBatch, UpdateBus,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::channel::{AggregationStream, ResultChannel};
use crate::config::CacheConfig;
use crate::coordinator::{CacheOp, Collaborators, Scheduler};
use crate::error::CacheError;
use crate::invalidation::InvalidationPolicy;
use crate::stats::{CacheStats, StatsSnapshot};

/// Builder for an [`AggregationCache`].
pub struct AggregationCacheBuilder {
    melee: Arc<dyn DataSource>,
    spell: Arc<dyn DataSource>,
    metadata: Arc<dyn MetadataProvider>,
    sink: Option<Arc<dyn EnrichmentSink>>,
    config: CacheConfig,
}

impl AggregationCacheBuilder {
    /// Start a builder from the two partial sources and the metadata view.
    ///
    /// `melee` is merged first, so `spell` wins on colliding keys.
    pub fn new(
        melee: Arc<dyn DataSource>,
        spell: Arc<dyn DataSource>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> Self {
        Self {
            melee,
            spell,
            metadata,
            sink: None,
            config: CacheConfig::default(),
        }
    }

    /// Where enrichment requests go. Defaults to a sink that only logs.
    pub fn sink(mut self, sink: Arc<dyn EnrichmentSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the scheduler and return a handle to it.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn spawn(self) -> AggregationCache {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(ResultChannel::new(self.config.result_buffer));
        let stats = Arc::new(CacheStats::default());
        let (stopped_tx, stopped_rx) = watch::channel(());

        let sink: Arc<dyn EnrichmentSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(TracingSink),
        };
        let deps = Arc::new(Collaborators {
            melee: self.melee,
            spell: self.spell,
            metadata: self.metadata,
            sink,
        });
        let policy = InvalidationPolicy::new(self.config.watched_event_types.clone());

        debug!(
            watched = ?self.config.watched_event_types,
            fetch_timeout_ms = ?self.config.fetch_timeout_ms,
            "spawning aggregation cache"
        );
        Scheduler::new(
            ops_rx,
            deps,
            policy,
            self.config.fetch_timeout_duration(),
            Arc::clone(&channel),
            Arc::clone(&stats),
            stopped_tx,
        )
        .spawn();

        AggregationCache {
            ops_tx,
            channel,
            stats,
            stopped: stopped_rx,
        }
    }
}

/// Incremental cache of the merged damage table.
#[derive(Clone)]
pub struct AggregationCache {
    ops_tx: mpsc::UnboundedSender<CacheOp>,
    channel: Arc<ResultChannel>,
    stats: Arc<CacheStats>,
    /// Closed once the scheduler has stopped.
    stopped: watch::Receiver<()>,
}

impl AggregationCache {
    pub fn builder(
        melee: Arc<dyn DataSource>,
        spell: Arc<dyn DataSource>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> AggregationCacheBuilder {
        AggregationCacheBuilder::new(melee, spell, metadata)
    }

    /// Request the table under `mode` and subscribe to it.
    ///
    /// The stream first yields the latest published result (if any), which
    /// may still belong to the previous mode after a switch, then every later
    /// publish. The first call initializes the cache; a call with a mode other
    /// than the current one triggers a recompute. Never blocks.
    pub fn get_data(&self, mode: impl Into<Mode>) -> AggregationStream {
        let stream = self.channel.subscribe();
        self.send(CacheOp::Request { mode: mode.into() });
        stream
    }

    /// Subscribe to published results without requesting a mode.
    pub fn subscribe(&self) -> AggregationStream {
        self.channel.subscribe()
    }

    /// The most recently published result.
    pub fn latest(&self) -> Option<Arc<AggregationResult>> {
        self.channel.latest()
    }

    /// Hand an update batch to the scheduler directly.
    pub fn handle_update(&self, batch: UpdateBatch) -> Result<(), CacheError> {
        self.ops_tx
            .send(CacheOp::Update { batch })
            .map_err(|_| CacheError::ChannelClosed)
    }

    /// Forward every batch published on `bus` to the scheduler.
    ///
    /// The listener stops when the bus closes or the scheduler stops, whether
    /// through `shutdown` or because every handle was dropped. It does not
    /// keep the scheduler alive. A lagged receiver is reported to the
    /// scheduler, which treats the missed batches as an invalidation.
    pub fn start_update_listener(&self, bus: &UpdateBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let ops = self.ops_tx.downgrade();
        let mut stopped = self.stopped.clone();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    received = rx.recv() => received,
                    _ = stopped.changed() => {
                        debug!("aggregation cache stopped, stopping update listener");
                        break;
                    }
                };
                let op = match received {
                    Ok(batch) => CacheOp::Update { batch },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        CacheOp::Lagged { skipped }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("update bus closed, stopping aggregation cache listener");
                        break;
                    }
                };
                let Some(ops_tx) = ops.upgrade() else {
                    debug!("aggregation cache dropped, stopping update listener");
                    break;
                };
                if ops_tx.send(op).is_err() {
                    debug!("aggregation cache stopped, stopping update listener");
                    break;
                }
            }
        })
    }

    /// Wait until no recompute is in flight and no follow-up is pending.
    pub async fn settle(&self) -> Result<(), CacheError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.ops_tx
            .send(CacheOp::Settle {
                response: response_tx,
            })
            .map_err(|_| CacheError::ChannelClosed)?;

        response_rx.await.map_err(|_| CacheError::ChannelClosed)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the scheduler. Any in-flight recompute is abandoned and every
    /// subscription ends after its buffered results.
    pub fn shutdown(&self) {
        self.send(CacheOp::Shutdown);
    }

    /// Check if the scheduler is gone.
    pub fn is_closed(&self) -> bool {
        self.ops_tx.is_closed()
    }

    fn send(&self, op: CacheOp) {
        if self.ops_tx.send(op).is_err() {
            trace!("aggregation cache stopped, dropping operation");
        }
    }
}
