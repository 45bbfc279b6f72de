//! Sink directory contract: the pool of remote endpoints entries are shipped to.
//!
//! The shipper never tracks sink health itself. It asks the directory for a
//! sink per delivery and reports the outcome back, so the directory can evict
//! sinks that keep failing. Implementations must tolerate concurrent reports
//! from many dispatch units and a concurrent re-choose.

use async_trait::async_trait;
use std::fmt;

use crate::error::Result;

/// Handle to one remote sink, borrowed for a single delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkHandle {
    /// Address of the remote region server, e.g. `"rs1.peer:16020"`.
    pub addr: String,
}

impl SinkHandle {
    /// Create a handle for the given address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl fmt::Display for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

/// The set of currently usable sinks for one peer cluster.
#[async_trait]
pub trait SinkDirectory: Send + Sync + 'static {
    /// Re-select the sink pool from the peer's current region servers.
    async fn choose_sinks(&self);

    /// Snapshot of the sinks currently in the pool.
    async fn sinks(&self) -> Vec<SinkHandle>;

    /// Number of sinks currently in the pool.
    async fn sink_count(&self) -> usize {
        self.sinks().await.len()
    }

    /// Pick a sink for one delivery.
    ///
    /// Fails with [`crate::ShipError::NoSinksAvailable`] when the pool is empty.
    async fn acquire_sink(&self) -> Result<SinkHandle>;

    /// Record a successful delivery through `sink`.
    async fn report_success(&self, sink: &SinkHandle);

    /// Record a failed delivery through `sink`.
    async fn report_failure(&self, sink: &SinkHandle);
}
