//! Process-wide shutdown signal.
//!
//! One broadcast channel that every long-lived task subscribes to. The
//! sender side is cloneable and cheap; a subscriber that joins after the
//! trigger still observes shutdown immediately (the channel closes when the
//! last sender drops, and we also keep a triggered flag for late joiners).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Cloneable shutdown handle.
#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Shutdown {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal every subscriber. Idempotent.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::Release);
        // Send fails when nobody is subscribed, which is fine.
        let _ = self.tx.send(());
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Wait until shutdown is requested.
    pub async fn wait(&self) {
        if self.is_triggered() {
            return;
        }
        let mut rx = self.tx.subscribe();
        // A trigger between the check above and the subscribe is caught by
        // the flag re-check; the recv error case (sender alive, lagged) is
        // equivalent to a signal here.
        if self.is_triggered() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
