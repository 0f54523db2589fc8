//! Shared fixtures for the aggregation cache integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meter_core::{
    AbilityId, ActorDamage, ActorId, DataSource, EnrichmentRequest, EnrichmentSink, MeterError,
    Mode, PartialAggregate, TimeWindow, Unit,
};
use tokio::sync::Semaphore;

/// Build a partial aggregate from `(actor, ability, amount)` triples.
pub fn partial(entries: &[(u64, u32, u64)]) -> PartialAggregate {
    let mut partial = PartialAggregate::new();
    for &(actor, ability, amount) in entries {
        partial
            .entry(ActorId(actor))
            .or_insert_with(|| ActorDamage::new(Unit::player(actor)))
            .abilities
            .insert(AbilityId(ability), amount);
    }
    partial
}

pub fn window() -> TimeWindow {
    TimeWindow::new(1_000, 60_000)
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Data source whose fetches block until the test releases them.
pub struct GatedSource {
    name: String,
    data: Mutex<HashMap<Mode, PartialAggregate>>,
    gate: Semaphore,
    gated: AtomicBool,
    fail_next: AtomicBool,
    fetches: AtomicU64,
}

impl GatedSource {
    /// A source whose fetches wait for [`GatedSource::release`].
    pub fn gated(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            data: Mutex::new(HashMap::new()),
            gate: Semaphore::new(0),
            gated: AtomicBool::new(true),
            fail_next: AtomicBool::new(false),
            fetches: AtomicU64::new(0),
        })
    }

    pub fn set(&self, mode: Mode, partial: PartialAggregate) {
        self.data.lock().unwrap().insert(mode, partial);
    }

    /// Let `fetches` more fetches complete.
    pub fn release(&self, fetches: usize) {
        self.gate.add_permits(fetches);
    }

    /// Stop gating; every pending and future fetch completes.
    pub fn open(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    /// Make the next fetch to pass the gate fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Fetches started (including those still waiting at the gate).
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for GatedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, mode: Mode) -> Result<PartialAggregate, MeterError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.gate.acquire().await.expect("gate closed").forget();
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(MeterError::source_failed(&self.name, "gated failure"));
        }
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(&mode)
            .cloned()
            .unwrap_or_default())
    }
}

/// Sink recording every request it receives.
#[derive(Default)]
pub struct RecordingSink {
    requests: Mutex<Vec<EnrichmentRequest>>,
    fail: bool,
    attempts: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A sink rejecting every request.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn requests(&self) -> Vec<EnrichmentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentSink for RecordingSink {
    async fn request(&self, request: EnrichmentRequest) -> Result<(), MeterError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(MeterError::Enrichment("lookup service unavailable".to_string()));
        }
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

/// Source that panics on its first fetch and serves `partial` afterwards.
pub struct PanickingSource {
    partial: PartialAggregate,
    armed: AtomicBool,
}

impl PanickingSource {
    pub fn new(partial: PartialAggregate) -> Arc<Self> {
        Arc::new(Self {
            partial,
            armed: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl DataSource for PanickingSource {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn fetch(&self, _mode: Mode) -> Result<PartialAggregate, MeterError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("source blew up");
        }
        Ok(self.partial.clone())
    }
}
