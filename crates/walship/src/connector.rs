//! Peer connector: waits until the peer cluster offers at least one sink.

use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::liveness::Liveness;
use crate::sink::SinkDirectory;

/// Re-choose sinks until the pool is non-empty or liveness drops.
///
/// The sleep multiplier grows by one after every empty attempt with no
/// ceiling. Returns the number of sinks available when the loop ended.
pub async fn connect_to_peers(
    sinks: &dyn SinkDirectory,
    backoff: &dyn Backoff,
    liveness: &Liveness,
) -> usize {
    let mut multiplier: u32 = 1;
    let mut count = sinks.sink_count().await;

    while liveness.is_running() && count == 0 {
        sinks.choose_sinks().await;
        count = sinks.sink_count().await;

        if liveness.is_running() && count == 0 {
            warn!(multiplier = multiplier, "no sinks available on peer cluster");
            backoff
                .sleep_for_retries("waiting for peer sinks", multiplier)
                .await;
            multiplier = multiplier.saturating_add(1);
        }
    }

    if count > 0 {
        info!(sinks = count, "connected to peer cluster");
    }
    count
}
