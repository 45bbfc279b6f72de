//! Sink manager: picks a random subset of the peer's region servers as sinks
//! and evicts sinks that keep failing.
//!
//! Only a fraction (`replication_ratio`) of the peer's servers is used at a
//! time, so many source clusters replicating into one peer spread their load
//! instead of all hitting the same servers.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, ShipError};
use crate::sink::{SinkDirectory, SinkHandle};

/// Source of the peer cluster's current region server addresses.
#[async_trait]
pub trait EndpointSource: Send + Sync + 'static {
    /// List the addresses of the peer's live region servers.
    async fn region_servers(&self) -> Result<Vec<String>>;

    /// Counter bumped every time the server list changes.
    fn generation(&self) -> u64;
}

/// An [`EndpointSource`] whose server list is set by the caller.
#[derive(Debug, Default)]
pub struct StaticEndpoints {
    addrs: RwLock<Vec<String>>,
    generation: AtomicU64,
}

impl StaticEndpoints {
    /// Create a source with an initial server list.
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs: RwLock::new(addrs),
            generation: AtomicU64::new(1),
        }
    }

    /// Replace the server list and bump the generation.
    pub async fn set(&self, addrs: Vec<String>) {
        *self.addrs.write().await = addrs;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EndpointSource for StaticEndpoints {
    async fn region_servers(&self) -> Result<Vec<String>> {
        Ok(self.addrs.read().await.clone())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Sink selection settings.
#[derive(Debug, Clone)]
pub struct SinkManagerConfig {
    /// Fraction of the peer's region servers to use as sinks (0, 1].
    pub replication_ratio: f64,
    /// Failed deliveries after which a sink is dropped from the pool.
    pub bad_sink_threshold: u32,
}

impl Default for SinkManagerConfig {
    fn default() -> Self {
        Self {
            replication_ratio: 0.1,
            bad_sink_threshold: 3,
        }
    }
}

/// Counters describing sink churn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkManagerStats {
    /// Number of times the pool was re-chosen.
    pub rechooses: u64,
    /// Number of sinks evicted for repeated failures.
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct SinkPool {
    sinks: Vec<SinkHandle>,
    bad_reports: HashMap<SinkHandle, u32>,
    chosen_at_generation: u64,
    stats: SinkManagerStats,
}

/// Default [`SinkDirectory`] backed by an [`EndpointSource`].
pub struct SinkManager {
    config: SinkManagerConfig,
    source: Arc<dyn EndpointSource>,
    pool: Mutex<SinkPool>,
}

impl SinkManager {
    /// Create a manager with an empty pool. Call `choose_sinks` to fill it.
    pub fn new(config: SinkManagerConfig, source: Arc<dyn EndpointSource>) -> Self {
        Self {
            config,
            source,
            pool: Mutex::new(SinkPool::default()),
        }
    }

    /// Snapshot of the churn counters.
    pub async fn stats(&self) -> SinkManagerStats {
        self.pool.lock().await.stats.clone()
    }

    /// Bad-report count currently held against `sink`.
    pub async fn bad_reports(&self, sink: &SinkHandle) -> u32 {
        self.pool
            .lock()
            .await
            .bad_reports
            .get(sink)
            .copied()
            .unwrap_or(0)
    }

    fn sinks_to_keep(&self, available: usize) -> usize {
        (available as f64 * self.config.replication_ratio).ceil() as usize
    }

    async fn choose_locked(&self, pool: &mut SinkPool) {
        let generation = self.source.generation();
        let mut addrs = match self.source.region_servers().await {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(error = %e, "failed to list peer region servers");
                Vec::new()
            }
        };
        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(self.sinks_to_keep(addrs.len()));

        pool.sinks = addrs.into_iter().map(SinkHandle::new).collect();
        pool.bad_reports.clear();
        pool.chosen_at_generation = generation;
        pool.stats.rechooses += 1;

        info!(
            sinks = pool.sinks.len(),
            generation = generation,
            "chose replication sinks"
        );
    }
}

#[async_trait]
impl SinkDirectory for SinkManager {
    async fn choose_sinks(&self) {
        let mut pool = self.pool.lock().await;
        self.choose_locked(&mut pool).await;
    }

    async fn sinks(&self) -> Vec<SinkHandle> {
        self.pool.lock().await.sinks.clone()
    }

    async fn acquire_sink(&self) -> Result<SinkHandle> {
        let mut pool = self.pool.lock().await;
        if self.source.generation() > pool.chosen_at_generation || pool.sinks.is_empty() {
            self.choose_locked(&mut pool).await;
        }
        pool.sinks
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(ShipError::NoSinksAvailable)
    }

    async fn report_success(&self, sink: &SinkHandle) {
        let mut pool = self.pool.lock().await;
        pool.bad_reports.remove(sink);
    }

    async fn report_failure(&self, sink: &SinkHandle) {
        let mut pool = self.pool.lock().await;
        let count = pool.bad_reports.entry(sink.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        debug!(sink = %sink, bad_reports = count, "sink reported bad");

        if count >= self.config.bad_sink_threshold {
            pool.sinks.retain(|s| s != sink);
            pool.bad_reports.remove(sink);
            pool.stats.evictions += 1;
            warn!(sink = %sink, bad_reports = count, "evicted replication sink");
            if pool.sinks.is_empty() {
                self.choose_locked(&mut pool).await;
            }
        }
    }
}
