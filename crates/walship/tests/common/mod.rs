//! Scripted collaborators shared by the integration tests.
//!
//! Every double appends to one shared event log so tests can assert on the
//! order in which the shipper talked to its collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use walship::backoff::Backoff;
use walship::delivery::SinkDelivery;
use walship::metrics::ShipMetrics;
use walship::{
    InterClusterShipper, Liveness, PeerStateFlag, ReplicateBatch, Result, ShipError,
    ShipperConfig, SinkDirectory, SinkHandle, WalEntry,
};

/// One interaction with a collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ChooseSinks,
    Deliver { sink: String, seqs: Vec<u64> },
    Sleep { reason: String, multiplier: u32 },
}

/// Shared, ordered record of collaborator calls.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Sequence numbers of every delivery, in call order.
    pub fn deliveries(&self) -> Vec<Vec<u64>> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::Deliver { seqs, .. } => Some(seqs),
                _ => None,
            })
            .collect()
    }

    /// Multipliers passed to the backoff, in call order.
    pub fn sleeps(&self) -> Vec<u32> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::Sleep { multiplier, .. } => Some(multiplier),
                _ => None,
            })
            .collect()
    }
}

/// Sink directory whose pool is set by the test.
///
/// `choose_sinks` refills the pool from `available`, which starts equal to
/// the initial pool.
pub struct ScriptedSinks {
    pool: Mutex<Vec<SinkHandle>>,
    available: Mutex<Vec<SinkHandle>>,
    next: AtomicUsize,
    log: EventLog,
    pub successes: AtomicUsize,
    pub failures: AtomicUsize,
}

impl ScriptedSinks {
    pub fn new(count: usize, log: EventLog) -> Self {
        let sinks: Vec<SinkHandle> = (0..count)
            .map(|i| SinkHandle::new(format!("rs{}.peer:16020", i)))
            .collect();
        Self {
            pool: Mutex::new(sinks.clone()),
            available: Mutex::new(sinks),
            next: AtomicUsize::new(0),
            log,
            successes: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Change what the next `choose_sinks` call will select.
    pub fn set_available(&self, count: usize) {
        *self.available.lock().unwrap() = (0..count)
            .map(|i| SinkHandle::new(format!("rs{}.peer:16020", i)))
            .collect();
    }

    /// Empty the pool and everything `choose_sinks` could pick.
    pub fn clear(&self) {
        self.pool.lock().unwrap().clear();
        self.available.lock().unwrap().clear();
    }

    pub fn choose_calls(&self) -> usize {
        self.log
            .snapshot()
            .iter()
            .filter(|e| **e == Event::ChooseSinks)
            .count()
    }
}

#[async_trait]
impl SinkDirectory for ScriptedSinks {
    async fn choose_sinks(&self) {
        self.log.push(Event::ChooseSinks);
        let available = self.available.lock().unwrap().clone();
        *self.pool.lock().unwrap() = available;
    }

    async fn sinks(&self) -> Vec<SinkHandle> {
        self.pool.lock().unwrap().clone()
    }

    async fn acquire_sink(&self) -> Result<SinkHandle> {
        let pool = self.pool.lock().unwrap();
        if pool.is_empty() {
            return Err(ShipError::NoSinksAvailable);
        }
        let i = self.next.fetch_add(1, Ordering::SeqCst) % pool.len();
        Ok(pool[i].clone())
    }

    async fn report_success(&self, _sink: &SinkHandle) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    async fn report_failure(&self, _sink: &SinkHandle) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// How a scripted delivery attempt should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    TableNotFound,
    Timeout,
    Refused,
    Transport,
}

impl Fault {
    fn to_error(self, sink: &SinkHandle) -> ShipError {
        match self {
            Fault::TableNotFound => ShipError::Remote {
                kind: walship::error::RemoteErrorKind::TableNotFound {
                    table: "orders".to_string(),
                },
                msg: "table orders does not exist".to_string(),
            },
            Fault::Timeout => ShipError::SocketTimeout {
                sink: sink.addr.clone(),
                timeout_ms: 60_000,
            },
            Fault::Refused => ShipError::ConnectionRefused {
                sink: sink.addr.clone(),
            },
            Fault::Transport => ShipError::Transport {
                msg: "connection reset".to_string(),
            },
        }
    }
}

/// Delivery that fails sub-batches according to a per-entry script.
///
/// Faults are keyed by the sequence number of a sub-batch's first entry and
/// consumed one per attempt; once a key's faults are used up it succeeds.
/// Stalled keys never complete.
pub struct ScriptedDelivery {
    faults: Mutex<HashMap<u64, VecDeque<Fault>>>,
    stalled: HashSet<u64>,
    log: EventLog,
}

impl ScriptedDelivery {
    pub fn new(log: EventLog) -> Self {
        Self {
            faults: Mutex::new(HashMap::new()),
            stalled: HashSet::new(),
            log,
        }
    }

    /// Fail the sub-batch starting at `first_seq` with each of `faults` in turn.
    pub fn fail(self, first_seq: u64, faults: &[Fault]) -> Self {
        self.faults
            .lock()
            .unwrap()
            .entry(first_seq)
            .or_default()
            .extend(faults.iter().copied());
        self
    }

    /// Never finish delivering the sub-batch starting at `first_seq`.
    pub fn stall(mut self, first_seq: u64) -> Self {
        self.stalled.insert(first_seq);
        self
    }
}

#[async_trait]
impl SinkDelivery for ScriptedDelivery {
    async fn deliver(&self, sink: &SinkHandle, entries: &[WalEntry]) -> Result<()> {
        self.log.push(Event::Deliver {
            sink: sink.addr.clone(),
            seqs: entries.iter().map(|e| e.seq).collect(),
        });
        if entries.first().is_some_and(|e| self.stalled.contains(&e.seq)) {
            std::future::pending::<()>().await;
        }
        let fault = entries
            .first()
            .and_then(|e| self.faults.lock().unwrap().get_mut(&e.seq)?.pop_front());
        match fault {
            Some(fault) => Err(fault.to_error(sink)),
            None => Ok(()),
        }
    }
}

type SleepHook = Box<dyn Fn(usize) + Send + Sync>;

/// Backoff that records each requested multiplier and returns immediately.
pub struct RecordingBackoff {
    max_retries_multiplier: u32,
    calls: AtomicUsize,
    log: EventLog,
    on_sleep: Option<SleepHook>,
}

impl RecordingBackoff {
    pub fn new(max_retries_multiplier: u32, log: EventLog) -> Self {
        Self {
            max_retries_multiplier,
            calls: AtomicUsize::new(0),
            log,
            on_sleep: None,
        }
    }

    /// Run `hook` with the 1-based sleep count on every sleep.
    pub fn on_sleep(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_sleep = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl Backoff for RecordingBackoff {
    async fn sleep_for_retries(&self, reason: &str, multiplier: u32) -> bool {
        self.log.push(Event::Sleep {
            reason: reason.to_string(),
            multiplier,
        });
        let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.on_sleep {
            hook(count);
        }
        tokio::task::yield_now().await;
        multiplier < self.max_retries_multiplier
    }
}

/// Metrics double recording every call.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    pub ages: Mutex<Vec<(u64, String)>>,
    pub refreshes: Mutex<Vec<String>>,
}

impl ShipMetrics for RecordingMetrics {
    fn set_age_of_last_shipped(&self, write_time_ms: u64, group: &str) {
        self.ages
            .lock()
            .unwrap()
            .push((write_time_ms, group.to_string()));
    }

    fn refresh_age_of_last_shipped(&self, group: &str) {
        self.refreshes.lock().unwrap().push(group.to_string());
    }
}

/// `count` entries with keys `region-{i}`, seq `i` and write time `1000 + i`.
pub fn batch(group: &str, count: u64) -> ReplicateBatch {
    let entries = (0..count)
        .map(|i| WalEntry::new(i, format!("region-{}", i), 1_000 + i, vec![0u8; 16]))
        .collect();
    ReplicateBatch::new(group, entries)
}

/// Everything a shipper test needs to drive and inspect one shipper.
pub struct Harness {
    pub log: EventLog,
    pub sinks: Arc<ScriptedSinks>,
    pub metrics: Arc<RecordingMetrics>,
    pub peer: PeerStateFlag,
    pub liveness: Liveness,
}

impl Harness {
    pub fn new(sink_count: usize) -> Self {
        let log = EventLog::default();
        Self {
            sinks: Arc::new(ScriptedSinks::new(sink_count, log.clone())),
            log,
            metrics: Arc::new(RecordingMetrics::default()),
            peer: PeerStateFlag::new(true),
            liveness: Liveness::new(),
        }
    }

    pub fn delivery(&self) -> ScriptedDelivery {
        ScriptedDelivery::new(self.log.clone())
    }

    pub fn backoff(&self) -> RecordingBackoff {
        RecordingBackoff::new(300, self.log.clone())
    }

    pub fn shipper(
        &self,
        config: ShipperConfig,
        delivery: ScriptedDelivery,
        backoff: RecordingBackoff,
    ) -> InterClusterShipper {
        InterClusterShipper::new(
            config,
            self.sinks.clone(),
            Arc::new(delivery),
            self.metrics.clone(),
            Arc::new(self.peer.clone()),
            self.liveness.clone(),
        )
        .unwrap()
        .with_backoff(Arc::new(backoff))
    }
}
