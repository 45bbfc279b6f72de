//! Inter-cluster shipper: the retry loop that drives a batch to the peer.
//!
//! One call to [`InterClusterShipper::replicate`] partitions the batch, ships
//! the pending sub-batches in parallel, drops the ones the peer acknowledged
//! and backs off before retrying the rest. It returns only on full delivery,
//! when no sink exists at all, or when the shipper is stopped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::backoff::{Backoff, LivenessBackoff};
use crate::config::ShipperConfig;
use crate::connector::connect_to_peers;
use crate::delivery::SinkDelivery;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::entry::{now_ms, ReplicateBatch, SubBatch};
use crate::error::{FailureClass, Result, ShipError};
use crate::liveness::{Liveness, PeerState};
use crate::metrics::ShipMetrics;
use crate::partition::{partition_batch, partition_count};
use crate::sink::SinkDirectory;

/// Where a `replicate` call is, or where it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipPhase {
    /// Waiting for the peer to offer at least one sink.
    AwaitingPeers,
    /// Shipping pending sub-batches.
    Dispatching,
    /// Sleeping after a failed round or while the peer is disabled.
    Backoff,
    /// Every entry was acknowledged.
    DoneSuccess,
    /// Gave up: no sinks, or the shipper was stopped.
    DoneAborted,
}

/// Summary of one `replicate` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipReport {
    /// Final phase: `DoneSuccess` or `DoneAborted`.
    pub phase: ShipPhase,
    /// Dispatch rounds run.
    pub rounds: u32,
    /// Entries acknowledged by the peer.
    pub delivered_entries: usize,
    /// Class of the failure that chose the most recent backoff.
    pub last_failure_class: Option<FailureClass>,
}

impl ShipReport {
    fn new() -> Self {
        Self {
            phase: ShipPhase::AwaitingPeers,
            rounds: 0,
            delivered_entries: 0,
            last_failure_class: None,
        }
    }

    /// Returns true if the whole batch was delivered.
    pub fn succeeded(&self) -> bool {
        self.phase == ShipPhase::DoneSuccess
    }
}

/// Ships WAL batches to one peer cluster.
///
/// Calls to `replicate` for the same WAL group must not overlap.
pub struct InterClusterShipper {
    config: ShipperConfig,
    sinks: Arc<dyn SinkDirectory>,
    dispatcher: Dispatcher,
    metrics: Arc<dyn ShipMetrics>,
    peer_state: Arc<dyn PeerState>,
    liveness: Liveness,
    backoff: Arc<dyn Backoff>,
    peers_selected: AtomicBool,
    stopped: AtomicBool,
}

impl InterClusterShipper {
    /// Create a shipper that sleeps on the tokio clock between retries.
    ///
    /// Fails with [`ShipError::Config`] if `config` does not validate.
    pub fn new(
        config: ShipperConfig,
        sinks: Arc<dyn SinkDirectory>,
        delivery: Arc<dyn SinkDelivery>,
        metrics: Arc<dyn ShipMetrics>,
        peer_state: Arc<dyn PeerState>,
        liveness: Liveness,
    ) -> Result<Self> {
        config.validate()?;
        let backoff = Arc::new(LivenessBackoff::new(
            config.sleep_for_retries(),
            config.max_retries_multiplier,
            liveness.clone(),
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&sinks), delivery, config.max_threads);
        Ok(Self {
            config,
            sinks,
            dispatcher,
            metrics,
            peer_state,
            liveness,
            backoff,
            peers_selected: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Replace the retry sleeper.
    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Settings this shipper runs with.
    pub fn config(&self) -> &ShipperConfig {
        &self.config
    }

    /// Liveness flag shared with whoever stops the shipper.
    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Returns true once the peer connector has run for this shipper.
    pub fn peers_selected(&self) -> bool {
        self.peers_selected.load(Ordering::SeqCst)
    }

    /// Ship `batch`, retrying until every entry is acknowledged.
    ///
    /// Returns false if no sink exists or the shipper was stopped; the caller
    /// must then keep its position in the WAL.
    pub async fn replicate(&self, batch: &ReplicateBatch) -> bool {
        self.replicate_with_report(batch).await.succeeded()
    }

    /// Like [`InterClusterShipper::replicate`], returning what happened.
    pub async fn replicate_with_report(&self, batch: &ReplicateBatch) -> ShipReport {
        let mut report = ShipReport::new();
        let group = batch.group_id.as_str();

        let last_write_time_ms = match batch.last_write_time_ms() {
            Some(ts) => ts,
            None => {
                report.phase = ShipPhase::DoneSuccess;
                return report;
            }
        };

        if !self.peers_selected() && self.liveness.is_running() {
            connect_to_peers(self.sinks.as_ref(), self.backoff.as_ref(), &self.liveness).await;
            self.peers_selected.store(true, Ordering::SeqCst);
        }

        let sink_count = self.sinks.sink_count().await;
        if sink_count == 0 {
            warn!(
                group = group,
                "no replication sinks found, returning without replicating"
            );
            report.phase = ShipPhase::DoneAborted;
            return report;
        }

        let n = partition_count(self.config.max_threads, batch.len(), sink_count);
        let mut pending: BTreeMap<usize, SubBatch> = partition_batch(&batch.entries, n)
            .into_iter()
            .filter(|sub| !sub.is_empty())
            .map(|sub| (sub.ordinal, sub))
            .collect();
        trace!(
            group = group,
            entries = batch.len(),
            size_bytes = batch.size_bytes,
            sub_batches = pending.len(),
            "partitioned batch"
        );

        let mut multiplier: u32 = 1;
        while self.liveness.is_running() {
            if !self.peer_state.is_peer_enabled() {
                report.phase = ShipPhase::Backoff;
                if self
                    .backoff
                    .sleep_for_retries("replication is disabled", multiplier)
                    .await
                {
                    multiplier += 1;
                }
                continue;
            }

            report.phase = ShipPhase::Dispatching;
            report.rounds += 1;
            let submitted: Vec<SubBatch> = pending.values().cloned().collect();
            let round = self.dispatcher.dispatch(&submitted).await;

            for outcome in &round.outcomes {
                if let DispatchOutcome::Delivered { ordinal, entries } = outcome {
                    if pending.remove(ordinal).is_some() {
                        report.delivered_entries += entries;
                    }
                }
            }

            let (ordinal, error) = match round.last_failure() {
                Some(failure) => failure,
                None => {
                    self.metrics.set_age_of_last_shipped(last_write_time_ms, group);
                    self.metrics.record_shipped(group, batch.len(), batch.size_bytes);
                    debug!(
                        group = group,
                        entries = batch.len(),
                        rounds = report.rounds,
                        "batch shipped"
                    );
                    report.phase = ShipPhase::DoneSuccess;
                    return report;
                }
            };

            if !self.liveness.is_running()
                || round
                    .failures()
                    .any(|(_, cause)| matches!(cause, ShipError::Shutdown))
            {
                // stopped mid-round: not a delivery failure
                break;
            }

            for (failed, cause) in round.failures() {
                debug!(
                    group = group,
                    ordinal = failed,
                    error = %cause,
                    "sub-batch not delivered"
                );
            }

            let class = error.class();
            report.last_failure_class = Some(class);
            report.phase = ShipPhase::Backoff;
            self.metrics.refresh_age_of_last_shipped(group);
            self.metrics.record_failed_round(group, class);

            let (entries, age_ms) = pending
                .get(&ordinal)
                .map(|sub| (sub.len(), sub.oldest_age_ms(now_ms())))
                .unwrap_or((0, 0));

            if self.back_off_for(class, error, group, entries, age_ms, multiplier).await {
                multiplier += 1;
            }
        }

        info!(
            group = group,
            remaining_sub_batches = pending.len(),
            "shipper stopped before batch was delivered"
        );
        report.phase = ShipPhase::DoneAborted;
        report
    }

    /// Log the round's failure and sleep per its class.
    ///
    /// Returns true if the standard multiplier may grow.
    async fn back_off_for(
        &self,
        class: FailureClass,
        error: &ShipError,
        group: &str,
        entries: usize,
        age_ms: u64,
        multiplier: u32,
    ) -> bool {
        match class {
            FailureClass::MissingTable => {
                warn!(
                    group = group,
                    entries = entries,
                    age_ms = age_ms,
                    error = %error,
                    "table missing on peer cluster, retrying; create it or filter its entries"
                );
            }
            FailureClass::SocketTimeout => {
                let escalated = self.config.effective_socket_timeout_multiplier();
                warn!(
                    group = group,
                    entries = entries,
                    age_ms = age_ms,
                    multiplier = escalated,
                    error = %error,
                    "socket timeout shipping to peer; it may be failing over"
                );
                self.backoff
                    .sleep_for_retries("socket timeout shipping to peer", escalated)
                    .await;
                return false;
            }
            FailureClass::ConnectRefused => {
                warn!(
                    group = group,
                    entries = entries,
                    age_ms = age_ms,
                    error = %error,
                    "peer is unavailable, rechecking all sinks"
                );
                self.sinks.choose_sinks().await;
            }
            FailureClass::Other => {
                warn!(
                    group = group,
                    entries = entries,
                    age_ms = age_ms,
                    error = %error,
                    "can't replicate because of a local or network error"
                );
            }
        }

        self.backoff
            .sleep_for_retries("unable to replicate", multiplier)
            .await
    }

    /// Stop shipping: drop liveness, refuse new deliveries and abort running ones.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping inter-cluster shipper");
        self.liveness.stop();
        self.dispatcher.close();
    }

    /// Returns true once [`InterClusterShipper::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::WalEntry;
    use crate::liveness::PeerStateFlag;
    use crate::metrics::SourceMetrics;
    use crate::sink::SinkHandle;
    use crate::sink_manager::{SinkManager, SinkManagerConfig, StaticEndpoints};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FailFirst {
        remaining: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SinkDelivery for FailFirst {
        async fn deliver(&self, sink: &SinkHandle, _entries: &[WalEntry]) -> crate::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.remaining.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining.store(left - 1, Ordering::SeqCst);
                return Err(ShipError::Transport {
                    msg: format!("reset by {}", sink),
                });
            }
            Ok(())
        }
    }

    fn shipper(
        servers: usize,
        failures: usize,
    ) -> (InterClusterShipper, Arc<FailFirst>, Arc<SourceMetrics>) {
        let addrs = (0..servers).map(|i| format!("rs{}:16020", i)).collect();
        let sinks = Arc::new(SinkManager::new(
            SinkManagerConfig {
                replication_ratio: 1.0,
                bad_sink_threshold: 3,
            },
            Arc::new(StaticEndpoints::new(addrs)),
        ));
        let delivery = Arc::new(FailFirst {
            remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        });
        let metrics = Arc::new(SourceMetrics::new());
        let config = ShipperConfig {
            sleep_for_retries_ms: 10,
            max_threads: 1,
            ..Default::default()
        };
        let shipper = InterClusterShipper::new(
            config,
            sinks,
            delivery.clone(),
            metrics.clone(),
            Arc::new(PeerStateFlag::new(true)),
            Liveness::new(),
        )
        .unwrap();
        (shipper, delivery, metrics)
    }

    fn batch(n: u64) -> ReplicateBatch {
        let entries = (0..n)
            .map(|i| WalEntry::new(i, format!("region-{}", i), 1_000 + i, vec![0u8; 4]))
            .collect();
        ReplicateBatch::new("wal-group-1", entries)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ships_after_transient_failures() {
        let (shipper, delivery, metrics) = shipper(2, 2);
        let report = shipper.replicate_with_report(&batch(5)).await;
        assert!(report.succeeded());
        assert_eq!(report.rounds, 3);
        assert_eq!(report.delivered_entries, 5);
        assert_eq!(report.last_failure_class, Some(FailureClass::Other));
        assert_eq!(delivery.calls.load(Ordering::SeqCst), 3);

        let group = metrics.group("wal-group-1").unwrap();
        assert_eq!(group.last_shipped_write_time_ms, 1_004);
        assert_eq!(group.shipped_entries, 5);
        assert_eq!(group.failed_rounds[&FailureClass::Other], 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_delivered() {
        let (shipper, delivery, _) = shipper(0, 0);
        assert!(shipper.replicate(&ReplicateBatch::new("g", vec![])).await);
        assert_eq!(delivery.calls.load(Ordering::SeqCst), 0);
        assert!(!shipper.peers_selected());
    }

    #[tokio::test]
    async fn test_peers_selected_once() {
        let (shipper, _, _) = shipper(1, 0);
        assert!(!shipper.peers_selected());
        assert!(shipper.replicate(&batch(1)).await);
        assert!(shipper.peers_selected());
        assert!(shipper.replicate(&batch(2)).await);
    }

    #[tokio::test]
    async fn test_stopped_shipper_does_not_ship() {
        let (shipper, delivery, _) = shipper(1, 0);
        shipper.stop();
        shipper.stop();
        assert!(shipper.is_stopped());
        assert!(!shipper.liveness().is_running());

        let report = shipper.replicate_with_report(&batch(3)).await;
        assert_eq!(report.phase, ShipPhase::DoneAborted);
        assert_eq!(report.rounds, 0);
        assert_eq!(delivery.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = InterClusterShipper::new(
            ShipperConfig {
                max_threads: 0,
                ..Default::default()
            },
            Arc::new(SinkManager::new(
                SinkManagerConfig {
                    replication_ratio: 1.0,
                    bad_sink_threshold: 3,
                },
                Arc::new(StaticEndpoints::new(vec![])),
            )),
            Arc::new(FailFirst {
                remaining: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }),
            Arc::new(SourceMetrics::new()),
            Arc::new(PeerStateFlag::new(true)),
            Liveness::new(),
        );
        assert!(matches!(result, Err(ShipError::Config { .. })));
    }
}
