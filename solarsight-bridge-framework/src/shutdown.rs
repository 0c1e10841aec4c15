//! Cooperative shutdown signal shared by every bridge task.

use std::sync::Arc;

use tokio::sync::watch;

/// Broadcast side of the bridge shutdown signal.
///
/// Cloning is cheap; any clone may trigger shutdown. Tasks observe it through
/// [`subscribe`](Self::subscribe) and [`wait_for_shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Get a receiver for the signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolve once shutdown is requested or the signal's sender is gone.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Whether shutdown has been requested on this receiver.
pub fn is_shutdown(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}
