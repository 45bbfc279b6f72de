//! Dispatcher: fans pending sub-batches out to a bounded set of delivery
//! tasks and collects one outcome per sub-batch.
//!
//! At most `max_threads` deliveries run at once. Submitting past that bound
//! waits for a running delivery to finish rather than queueing. Every unit is
//! awaited, including after the first failure, so a round always reports the
//! full delivered/failed split.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, trace};

use crate::delivery::SinkDelivery;
use crate::entry::SubBatch;
use crate::error::ShipError;
use crate::sink::SinkDirectory;

/// Result of shipping one sub-batch.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The peer acknowledged every entry of the sub-batch.
    Delivered {
        /// Ordinal of the sub-batch.
        ordinal: usize,
        /// Number of entries delivered.
        entries: usize,
    },
    /// The sub-batch was not delivered.
    Failed {
        /// Ordinal of the sub-batch.
        ordinal: usize,
        /// Why delivery failed.
        error: ShipError,
    },
}

impl DispatchOutcome {
    /// Ordinal of the sub-batch this outcome is for.
    pub fn ordinal(&self) -> usize {
        match self {
            DispatchOutcome::Delivered { ordinal, .. } => *ordinal,
            DispatchOutcome::Failed { ordinal, .. } => *ordinal,
        }
    }

    /// Returns true if the sub-batch was delivered.
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered { .. })
    }
}

/// Outcomes of one dispatch round, in submission (ascending ordinal) order.
#[derive(Debug, Default)]
pub struct DispatchRound {
    /// One outcome per submitted sub-batch.
    pub outcomes: Vec<DispatchOutcome>,
}

impl DispatchRound {
    /// Number of sub-batches submitted in this round.
    pub fn submitted(&self) -> usize {
        self.outcomes.len()
    }

    /// Ordinals the peer acknowledged.
    pub fn delivered_ordinals(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .filter(|o| o.is_delivered())
            .map(DispatchOutcome::ordinal)
            .collect()
    }

    /// Failed ordinals with their causes.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &ShipError)> {
        self.outcomes.iter().filter_map(|o| match o {
            DispatchOutcome::Failed { ordinal, error } => Some((*ordinal, error)),
            DispatchOutcome::Delivered { .. } => None,
        })
    }

    /// The last failure in submission order, if any.
    pub fn last_failure(&self) -> Option<(usize, &ShipError)> {
        self.failures().last()
    }

    /// Returns true if nothing failed.
    pub fn all_delivered(&self) -> bool {
        self.outcomes.iter().all(DispatchOutcome::is_delivered)
    }
}

/// Ships sub-batches in parallel through a [`SinkDirectory`].
pub struct Dispatcher {
    sinks: Arc<dyn SinkDirectory>,
    delivery: Arc<dyn SinkDelivery>,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashMap<u64, AbortHandle>>,
    next_unit: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher running at most `max_threads` deliveries at once.
    pub fn new(
        sinks: Arc<dyn SinkDirectory>,
        delivery: Arc<dyn SinkDelivery>,
        max_threads: usize,
    ) -> Self {
        Self {
            sinks,
            delivery,
            permits: Arc::new(Semaphore::new(max_threads.max(1))),
            in_flight: Mutex::new(HashMap::new()),
            next_unit: AtomicU64::new(0),
        }
    }

    /// Ship every non-empty sub-batch and wait for all of them.
    ///
    /// Empty sub-batches are skipped and produce no outcome.
    pub async fn dispatch(&self, pending: &[SubBatch]) -> DispatchRound {
        let mut handles: Vec<(usize, u64, JoinHandle<DispatchOutcome>)> = Vec::new();
        let mut refused: Vec<DispatchOutcome> = Vec::new();

        for sub in pending.iter().filter(|s| !s.is_empty()) {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    refused.push(DispatchOutcome::Failed {
                        ordinal: sub.ordinal,
                        error: ShipError::Shutdown,
                    });
                    continue;
                }
            };

            trace!(
                ordinal = sub.ordinal,
                entries = sub.len(),
                "submitting sub-batch"
            );

            let sinks = Arc::clone(&self.sinks);
            let delivery = Arc::clone(&self.delivery);
            let sub = sub.clone();
            let ordinal = sub.ordinal;
            let handle = tokio::spawn(async move {
                let outcome = ship_sub_batch(sinks.as_ref(), delivery.as_ref(), &sub).await;
                drop(permit);
                outcome
            });
            let unit = self.track(handle.abort_handle());
            handles.push((ordinal, unit, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len() + refused.len());
        for (ordinal, unit, handle) in handles {
            let joined = handle.await;
            self.untrack(unit);
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => DispatchOutcome::Failed {
                    ordinal,
                    error: ShipError::Shutdown,
                },
                Err(e) => DispatchOutcome::Failed {
                    ordinal,
                    error: ShipError::WorkerFailed {
                        ordinal,
                        msg: e.to_string(),
                    },
                },
            };
            outcomes.push(outcome);
        }
        outcomes.extend(refused);
        outcomes.sort_by_key(DispatchOutcome::ordinal);

        DispatchRound { outcomes }
    }

    /// Stop accepting work and abort deliveries still running.
    ///
    /// Sub-batches waiting for a slot fail with [`ShipError::Shutdown`].
    /// Calling this more than once has no further effect.
    pub fn close(&self) {
        self.permits.close();
        let handles: Vec<AbortHandle> = self.lock_in_flight().drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            debug!(aborted = handles.len(), "aborting in-flight deliveries");
        }
        for handle in handles {
            handle.abort();
        }
    }

    /// Returns true once [`Dispatcher::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Number of delivery slots currently free.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Number of deliveries currently tracked for abort on close.
    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    fn track(&self, handle: AbortHandle) -> u64 {
        let unit = self.next_unit.fetch_add(1, Ordering::Relaxed);
        let mut in_flight = self.lock_in_flight();
        if self.permits.is_closed() {
            handle.abort();
        } else {
            in_flight.insert(unit, handle);
        }
        unit
    }

    fn untrack(&self, unit: u64) {
        self.lock_in_flight().remove(&unit);
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<u64, AbortHandle>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One dispatch unit: borrow a sink, deliver, report the sink's health.
async fn ship_sub_batch(
    sinks: &dyn SinkDirectory,
    delivery: &dyn SinkDelivery,
    sub: &SubBatch,
) -> DispatchOutcome {
    let sink = match sinks.acquire_sink().await {
        Ok(sink) => sink,
        Err(error) => {
            return DispatchOutcome::Failed {
                ordinal: sub.ordinal,
                error,
            }
        }
    };

    match delivery.deliver(&sink, &sub.entries).await {
        Ok(()) => {
            sinks.report_success(&sink).await;
            DispatchOutcome::Delivered {
                ordinal: sub.ordinal,
                entries: sub.len(),
            }
        }
        Err(error) => {
            debug!(
                ordinal = sub.ordinal,
                sink = %sink,
                error = %error,
                "delivery failed"
            );
            sinks.report_failure(&sink).await;
            DispatchOutcome::Failed {
                ordinal: sub.ordinal,
                error,
            }
        }
    }
}
