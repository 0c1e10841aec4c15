//! Message sinks: the delivery end of the outbound queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use solarsight_common::ZenohMode;

use crate::error::{BridgeError, Result};

/// How often the Zenoh sink re-checks router connectivity in client mode.
pub const CONNECTIVITY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A connected bus client that delivers one payload at a time.
///
/// Each `publish` call reports success or failure of that single attempt;
/// retrying is left to the caller. Connectivity is observed through a watch
/// channel so drain loops can sleep until the bus comes back.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Sink name for identification and logging.
    fn name(&self) -> &str;

    /// Publish `payload` to `topic`.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Subscribe to connectivity changes (`true` = connected).
    fn connectivity(&self) -> watch::Receiver<bool>;
}

/// Sink publishing to a Zenoh session.
///
/// In client mode the sink is connected only while at least one router is
/// reachable. Peer and router sessions have no upstream to lose, so they are
/// always considered connected.
pub struct ZenohSink {
    session: Arc<zenoh::Session>,
    mode: ZenohMode,
    connected: watch::Sender<bool>,
}

impl std::fmt::Debug for ZenohSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZenohSink")
            .field("mode", &self.mode)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ZenohSink {
    /// Create a sink over an open session.
    pub fn new(session: Arc<zenoh::Session>, mode: ZenohMode) -> Self {
        let (connected, _) = watch::channel(mode != ZenohMode::Client);
        Self {
            session,
            mode,
            connected,
        }
    }

    /// Get a reference to the Zenoh session.
    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }

    /// Whether the sink currently considers itself connected.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Spawn the router connectivity monitor (client mode only).
    ///
    /// The monitor exits when `shutdown` becomes `true` or its sender is dropped.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        if self.mode != ZenohMode::Client {
            return None;
        }

        let sink = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                let routers = sink.session.info().routers_zid().await.count();
                let connected = routers > 0;
                let previous = sink.connected.send_replace(connected);

                if previous != connected {
                    if connected {
                        tracing::info!(routers, "Zenoh router reachable");
                    } else {
                        tracing::warn!("Lost connection to all Zenoh routers, will retry...");
                    }
                }

                tokio::select! {
                    _ = crate::shutdown::wait_for_shutdown(&mut shutdown) => break,
                    _ = tokio::time::sleep(CONNECTIVITY_POLL_INTERVAL) => {}
                }
            }
            tracing::debug!("Zenoh connectivity monitor stopped");
        }))
    }
}

#[async_trait]
impl MessageSink for ZenohSink {
    fn name(&self) -> &str {
        "zenoh"
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected(self.name().to_string()));
        }

        self.session
            .put(topic, payload.to_string())
            .await
            .map_err(|e| BridgeError::publish(topic, e))
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}
