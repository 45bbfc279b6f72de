//! Liveness and peer-enabled flags consulted by the retry loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Running/stopped signal shared by a shipper and whoever stops it.
///
/// Cloning shares the flag. Once stopped it never becomes running again.
#[derive(Debug, Clone)]
pub struct Liveness {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Liveness {
    /// Create a flag in the running state.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(true);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Returns true until [`Liveness::stop`] is called.
    pub fn is_running(&self) -> bool {
        *self.rx.borrow()
    }

    /// Flip to stopped and wake everyone waiting in [`Liveness::stopped`].
    pub fn stop(&self) {
        self.tx.send_replace(false);
    }

    /// Resolves once the flag is stopped.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Administrative state of the peer, toggled outside the shipper.
pub trait PeerState: Send + Sync + 'static {
    /// Returns true if shipping to the peer is currently enabled.
    fn is_peer_enabled(&self) -> bool;
}

/// A [`PeerState`] backed by a shared atomic flag.
#[derive(Debug, Clone)]
pub struct PeerStateFlag {
    enabled: Arc<AtomicBool>,
}

impl PeerStateFlag {
    /// Create a flag with the given initial state.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    /// Enable shipping to the peer.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Disable shipping to the peer.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}

impl PeerState for PeerStateFlag {
    fn is_peer_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}
