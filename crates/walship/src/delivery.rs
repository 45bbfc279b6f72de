//! Remote delivery call: ships an ordered run of entries to one sink.
//!
//! Serialization and the RPC channel belong to the implementation; the
//! shipper only needs the outcome, classified through [`crate::ShipError`].

use async_trait::async_trait;

use crate::entry::WalEntry;
use crate::error::Result;
use crate::sink::SinkHandle;

/// Delivers entries to a remote sink.
///
/// Implementations must map failures onto the matching [`crate::ShipError`]
/// variant: remote application errors to `Remote`, socket timeouts to
/// `SocketTimeout`, refused or unreachable sinks to `ConnectionRefused`, and
/// anything else to `Transport` or `Io`.
#[async_trait]
pub trait SinkDelivery: Send + Sync + 'static {
    /// Ship `entries` to `sink` in the given order.
    ///
    /// Returns once the sink has acknowledged every entry.
    async fn deliver(&self, sink: &SinkHandle, entries: &[WalEntry]) -> Result<()>;
}
