//! Sleeping between retries.
//!
//! A retry sleeps `base * multiplier`. The caller owns the multiplier and
//! grows it while the sleeper reports it is still below the ceiling. Sleeps
//! end early when the shipper is stopped.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace};

use crate::liveness::Liveness;

/// Sleeps between retry attempts.
#[async_trait]
pub trait Backoff: Send + Sync + 'static {
    /// Sleep for `multiplier` base intervals, or until shutdown.
    ///
    /// Returns true if `multiplier` is still below the retry ceiling, meaning
    /// the caller may increment it for the next attempt.
    async fn sleep_for_retries(&self, reason: &str, multiplier: u32) -> bool;
}

/// [`Backoff`] on the tokio clock that wakes early when liveness drops.
#[derive(Debug, Clone)]
pub struct LivenessBackoff {
    base: Duration,
    max_retries_multiplier: u32,
    liveness: Liveness,
}

impl LivenessBackoff {
    /// Create a sleeper with the given base interval and multiplier ceiling.
    pub fn new(base: Duration, max_retries_multiplier: u32, liveness: Liveness) -> Self {
        Self {
            base,
            max_retries_multiplier,
            liveness,
        }
    }

    /// Duration of a sleep with the given multiplier.
    pub fn delay_for(&self, multiplier: u32) -> Duration {
        self.base.saturating_mul(multiplier)
    }
}

#[async_trait]
impl Backoff for LivenessBackoff {
    async fn sleep_for_retries(&self, reason: &str, multiplier: u32) -> bool {
        let delay = self.delay_for(multiplier);
        trace!(
            reason = reason,
            multiplier = multiplier,
            delay_ms = delay.as_millis() as u64,
            "sleeping before retry"
        );

        tokio::select! {
            biased;
            _ = self.liveness.stopped() => {
                debug!(reason = reason, "retry sleep interrupted by shutdown");
            }
            _ = tokio::time::sleep(delay) => {}
        }

        multiplier < self.max_retries_multiplier
    }
}
