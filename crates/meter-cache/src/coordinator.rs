//! Recompute scheduler actor.
//!
//! A single task owns the cache state and the rerun flag. Mode requests and
//! update batches arrive on its inbox and are processed one at a time.
//! Recomputes run on a spawned task and report back on a completion
//! channel, so at most one recompute is in flight; invalidations arriving
//! meanwhile collapse into one follow-up started when it completes.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use meter_core::{
    ActorRow, AggregationResult, DataSource, EnrichmentRequest, EnrichmentSink, MetadataProvider,
    Mode, PartialAggregate, TimeWindow, UpdateBatch,
};

use crate::channel::ResultChannel;
use crate::error::CacheError;
use crate::invalidation::InvalidationPolicy;
use crate::merge::{MergeOutput, merge};
use crate::stats::CacheStats;

/// External collaborators of one cache.
pub(crate) struct Collaborators {
    pub(crate) melee: Arc<dyn DataSource>,
    pub(crate) spell: Arc<dyn DataSource>,
    pub(crate) metadata: Arc<dyn MetadataProvider>,
    pub(crate) sink: Arc<dyn EnrichmentSink>,
}

/// Operations accepted by the scheduler.
pub(crate) enum CacheOp {
    /// A reader asked for the table under `mode`.
    Request { mode: Mode },
    /// An update batch arrived from the bus (or was handed in directly).
    Update { batch: UpdateBatch },
    /// The bus listener missed `skipped` batches.
    Lagged { skipped: u64 },
    /// Respond once no recompute is in flight.
    Settle { response: oneshot::Sender<()> },
    /// Stop the scheduler.
    Shutdown,
}

/// State owned exclusively by the scheduler.
#[derive(Default)]
struct CacheState {
    initialized: bool,
    current_mode: Mode,
    /// Window captured by the most recently started recompute.
    current_window: Option<TimeWindow>,
    last_published: Option<Arc<AggregationResult>>,
}

struct InFlight {
    id: u64,
    handle: JoinHandle<()>,
}

/// Outcome of one recompute, sent back to the scheduler.
struct Completion {
    id: u64,
    mode: Mode,
    window: TimeWindow,
    result: Result<Vec<ActorRow>, CacheError>,
}

pub(crate) struct Scheduler {
    state: CacheState,
    /// Set when an invalidation arrives while a recompute is in flight.
    rerun: bool,
    in_flight: Option<InFlight>,
    next_id: u64,
    settle_waiters: Vec<oneshot::Sender<()>>,
    ops_rx: mpsc::UnboundedReceiver<CacheOp>,
    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
    deps: Arc<Collaborators>,
    policy: InvalidationPolicy,
    fetch_timeout: Option<Duration>,
    channel: Arc<ResultChannel>,
    stats: Arc<CacheStats>,
    /// Dropped when the loop exits; update listeners wait on it.
    stopped: watch::Sender<()>,
}

impl Scheduler {
    pub(crate) fn new(
        ops_rx: mpsc::UnboundedReceiver<CacheOp>,
        deps: Arc<Collaborators>,
        policy: InvalidationPolicy,
        fetch_timeout: Option<Duration>,
        channel: Arc<ResultChannel>,
        stats: Arc<CacheStats>,
        stopped: watch::Sender<()>,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            state: CacheState::default(),
            rerun: false,
            in_flight: None,
            next_id: 0,
            settle_waiters: Vec::new(),
            ops_rx,
            done_tx,
            done_rx,
            deps,
            policy,
            fetch_timeout,
            channel,
            stats,
            stopped,
        }
    }

    /// Spawn the scheduler as a background task.
    pub(crate) fn spawn(self) {
        tokio::spawn(async move {
            self.run().await;
        });
    }

    /// Run the scheduler loop until shutdown or until every handle is gone.
    pub(crate) async fn run(mut self) {
        debug!("aggregation scheduler started");

        loop {
            tokio::select! {
                op = self.ops_rx.recv() => match op {
                    Some(CacheOp::Request { mode }) => self.request(mode),
                    Some(CacheOp::Update { batch }) => self.update(&batch),
                    Some(CacheOp::Lagged { skipped }) => self.lagged(skipped),
                    Some(CacheOp::Settle { response }) => self.settle(response),
                    Some(CacheOp::Shutdown) | None => break,
                },
                Some(done) = self.done_rx.recv() => self.finish(done),
            }
        }

        if let Some(in_flight) = self.in_flight.take() {
            in_flight.handle.abort();
            debug!(recompute = in_flight.id, "aborted in-flight recompute");
        }
        self.stats.in_flight.store(false, Ordering::SeqCst);
        self.channel.close();
        drop(self.stopped);
        debug!("aggregation scheduler stopped");
    }

    fn request(&mut self, mode: Mode) {
        if !self.state.initialized {
            debug!(mode = %mode, "first request, initializing cache");
            self.state.initialized = true;
            self.state.current_mode = mode;
            self.schedule();
        } else if self.state.current_mode != mode {
            debug!(from = %self.state.current_mode, to = %mode, "mode switch");
            self.state.current_mode = mode;
            CacheStats::bump(&self.stats.mode_switches);
            self.schedule();
        } else {
            trace!(mode = %mode, "request for current mode");
        }
    }

    fn update(&mut self, batch: &UpdateBatch) {
        CacheStats::bump(&self.stats.batches_received);

        if !self.state.initialized {
            CacheStats::bump(&self.stats.batches_ignored);
            trace!("cache not initialized, ignoring update batch");
            return;
        }
        if !self.policy.invalidates(batch) {
            CacheStats::bump(&self.stats.batches_ignored);
            trace!(kinds = ?batch.kinds, event_types = ?batch.event_types, "update batch does not invalidate");
            return;
        }

        CacheStats::bump(&self.stats.invalidations);
        self.schedule();
    }

    fn lagged(&mut self, skipped: u64) {
        CacheStats::bump(&self.stats.listener_lags);
        self.stats.batches_missed.fetch_add(skipped, Ordering::SeqCst);
        warn!(skipped, "update listener lagged, treating as invalidation");
        if self.state.initialized {
            self.schedule();
        }
    }

    fn settle(&mut self, response: oneshot::Sender<()>) {
        if self.in_flight.is_none() {
            let _ = response.send(());
        } else {
            self.settle_waiters.push(response);
        }
    }

    /// Start a recompute now, or flag a follow-up if one is in flight.
    fn schedule(&mut self) {
        if self.in_flight.is_some() {
            CacheStats::bump(&self.stats.reruns_requested);
            if !self.rerun {
                debug!("recompute in flight, follow-up scheduled");
            }
            self.rerun = true;
        } else {
            self.start();
        }
    }

    fn start(&mut self) {
        let Some(window) = self.deps.metadata.current_window() else {
            CacheStats::bump(&self.stats.recomputes_skipped);
            debug!(mode = %self.state.current_mode, "metadata not ready, skipping recompute");
            return;
        };

        let mode = self.state.current_mode;
        if self.state.current_window != Some(window) {
            debug!(?window, "time window changed");
            self.state.current_window = Some(window);
        }
        self.next_id += 1;
        let id = self.next_id;

        CacheStats::bump(&self.stats.recomputes_started);
        self.stats.in_flight.store(true, Ordering::SeqCst);
        debug!(recompute = id, mode = %mode, "starting recompute");

        let deps = Arc::clone(&self.deps);
        let done_tx = self.done_tx.clone();
        let fetch_timeout = self.fetch_timeout;
        let handle = tokio::spawn(async move {
            let result = AssertUnwindSafe(recompute(deps, mode, window, fetch_timeout))
                .catch_unwind()
                .await
                .unwrap_or(Err(CacheError::Panicked));
            let completion = Completion {
                id,
                mode,
                window,
                result,
            };
            if done_tx.send(completion).is_err() {
                trace!(recompute = id, "scheduler gone before recompute finished");
            }
        });

        self.in_flight = Some(InFlight { id, handle });
    }

    fn finish(&mut self, done: Completion) {
        match &self.in_flight {
            Some(in_flight) if in_flight.id == done.id => {}
            _ => {
                warn!(recompute = done.id, "completion for a recompute that is not in flight");
                return;
            }
        }
        self.in_flight = None;
        self.stats.in_flight.store(false, Ordering::SeqCst);

        match done.result {
            Ok(rows) => self.publish(done.mode, done.window, rows),
            Err(e) => {
                CacheStats::bump(&self.stats.recomputes_failed);
                warn!(
                    recompute = done.id,
                    mode = %done.mode,
                    error = %e,
                    "recompute failed, keeping last published result"
                );
            }
        }

        if self.rerun {
            self.rerun = false;
            CacheStats::bump(&self.stats.follow_ups_started);
            debug!("starting coalesced follow-up recompute");
            self.start();
        }

        if self.in_flight.is_none() {
            for waiter in self.settle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    /// Record and broadcast a result in one step.
    fn publish(&mut self, mode: Mode, window: TimeWindow, rows: Vec<ActorRow>) {
        let generation = self
            .state
            .last_published
            .as_ref()
            .map_or(0, |last| last.generation)
            + 1;
        let result = Arc::new(AggregationResult {
            generation,
            mode,
            window,
            rows,
        });

        self.state.last_published = Some(Arc::clone(&result));
        self.channel.publish(Arc::clone(&result));
        self.stats.generation.store(generation, Ordering::SeqCst);
        CacheStats::bump(&self.stats.recomputes_published);

        if mode != self.state.current_mode {
            debug!(generation, mode = %mode, "published result for a superseded mode");
        }
        debug!(
            generation,
            mode = %mode,
            actors = result.rows.len(),
            cells = result.cell_count(),
            "published aggregation result"
        );
    }
}

/// Fetch both partials concurrently, merge them and fire enrichment requests.
#[tracing::instrument(skip_all, fields(mode = %mode, reference_ts = ?window.reference_ts()))]
async fn recompute(
    deps: Arc<Collaborators>,
    mode: Mode,
    window: TimeWindow,
    fetch_timeout: Option<Duration>,
) -> Result<Vec<ActorRow>, CacheError> {
    let (melee, spell) = tokio::join!(
        fetch_partial(deps.melee.as_ref(), mode, fetch_timeout),
        fetch_partial(deps.spell.as_ref(), mode, fetch_timeout),
    );
    let (melee, spell) = (melee?, spell?);

    let MergeOutput { rows, enrichment } = merge(&[&melee, &spell], &window);
    trace!(actors = rows.len(), requests = enrichment.len(), "merged partial aggregates");

    spawn_enrichment(Arc::clone(&deps.sink), enrichment);
    Ok(rows)
}

async fn fetch_partial(
    source: &dyn DataSource,
    mode: Mode,
    fetch_timeout: Option<Duration>,
) -> Result<PartialAggregate, CacheError> {
    let result = match fetch_timeout {
        Some(limit) => tokio::time::timeout(limit, source.fetch(mode))
            .await
            .map_err(|_| CacheError::Timeout {
                source_name: source.name().to_string(),
                after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })?,
        None => source.fetch(mode).await,
    };

    result.map_err(|error| CacheError::Fetch {
        source_name: source.name().to_string(),
        error,
    })
}

/// Deliver enrichment requests on a detached task; failures are only logged.
fn spawn_enrichment(sink: Arc<dyn EnrichmentSink>, requests: Vec<EnrichmentRequest>) {
    if requests.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for request in requests {
            if let Err(e) = sink.request(request).await {
                warn!(error = %e, "enrichment request failed");
            }
        }
    });
}
