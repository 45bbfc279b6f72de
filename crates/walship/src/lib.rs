#![warn(missing_docs)]

//! walship: cross-cluster WAL shipping engine.
//!
//! Takes a batch of write-ahead-log entries and delivers it to a peer cluster,
//! splitting it into per-key sub-batches that ship in parallel, failing over
//! between remote sinks and retrying only the sub-batches the peer has not
//! acknowledged.

pub mod backoff;
pub mod config;
pub mod connector;
pub mod delivery;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod liveness;
pub mod metrics;
pub mod partition;
pub mod shipper;
pub mod sink;
pub mod sink_manager;

pub use config::ShipperConfig;
pub use entry::{ReplicateBatch, SubBatch, WalEntry};
pub use error::{FailureClass, Result, ShipError};
pub use liveness::{Liveness, PeerState, PeerStateFlag};
pub use metrics::{ShipMetrics, SourceMetrics};
pub use shipper::{InterClusterShipper, ShipPhase, ShipReport};
pub use sink::{SinkDirectory, SinkHandle};
