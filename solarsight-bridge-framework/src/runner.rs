//! Bridge runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use solarsight_common::{KeyExprBuilder, LoggingConfig, connect, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::queue::Outbox;
use crate::shutdown::{ShutdownHandle, wait_for_shutdown};
use crate::sink::{MessageSink, ZenohSink};
use crate::status::StatusPublisher;

/// How long each task gets to finish after shutdown is broadcast.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bridge runner that manages the lifecycle of a device bridge.
///
/// Handles:
/// - Logging initialization
/// - Zenoh connection and the [`ZenohSink`]
/// - The shared [`Outbox`]
/// - Task spawning and joining
/// - Graceful shutdown on Ctrl+C, SIGTERM or an internal shutdown request
/// - Status publishing (optional)
///
/// # Example
///
/// ```ignore
/// use solarsight_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("mybridge.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args)).await?;
///
///     let producer = runner.outbox().producer("site/device/values");
///     let shutdown = runner.shutdown_handle();
///     runner.spawn("worker", async move {
///         // Worker logic here
///     });
///
///     runner.run().await
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging and status.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Zenoh session.
    session: Arc<zenoh::Session>,
    /// Sink over the session.
    sink: Arc<ZenohSink>,
    /// Outbound queues feeding the sink.
    outbox: Arc<Outbox>,
    /// Key expression builder for the configured prefix.
    keys: KeyExprBuilder,
    /// Status publisher (optional).
    status_publisher: Option<StatusPublisher>,
    /// Bridge-wide shutdown signal.
    shutdown: ShutdownHandle,
    /// Spawned tasks.
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner.
    pub async fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None).await
    }

    /// Create a new bridge runner with CLI args for log level override.
    ///
    /// This will:
    /// 1. Initialize logging based on config (with optional CLI override)
    /// 2. Connect to Zenoh
    /// 3. Create the sink, its connectivity monitor and the outbox
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let mut log_config: LoggingConfig = config.logging().clone();
        if let Some(level) = args.and_then(|a| a.log_level.clone()) {
            log_config.level = level;
        }
        init_tracing(&log_config)?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let session = Arc::new(
            connect(config.zenoh())
                .await
                .map_err(|e| BridgeError::ZenohConnection(e.to_string()))?,
        );

        let shutdown = ShutdownHandle::new();
        let sink = Arc::new(ZenohSink::new(session.clone(), config.zenoh().mode));

        let mut tasks = Vec::new();
        if let Some(monitor) = sink.spawn_monitor(shutdown.subscribe()) {
            tasks.push(("zenoh-monitor".to_string(), monitor));
        }

        let outbox = Arc::new(Outbox::new(
            sink.clone(),
            config.queue(),
            shutdown.subscribe(),
        )?);
        let keys = KeyExprBuilder::new(config.key_prefix());

        Ok(Self {
            name,
            version,
            config,
            session,
            sink,
            outbox,
            keys,
            status_publisher: None,
            shutdown,
            tasks,
        })
    }

    /// Enable status publishing.
    ///
    /// When enabled, the runner publishes status documents to
    /// `<key_prefix>/@/status` on startup and shutdown.
    pub fn with_status_publishing(mut self) -> Self {
        self.status_publisher = Some(StatusPublisher::new(
            self.sink.clone(),
            self.keys.status_key(),
            &self.name,
            &self.version,
        ));
        self
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a reference to the Zenoh session.
    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }

    /// Get the sink as a trait object.
    pub fn sink(&self) -> Arc<dyn MessageSink> {
        self.sink.clone()
    }

    /// Get the shared outbox.
    pub fn outbox(&self) -> Arc<Outbox> {
        self.outbox.clone()
    }

    /// Get the key expression builder.
    pub fn keys(&self) -> &KeyExprBuilder {
        &self.keys
    }

    /// Get a handle to the bridge-wide shutdown signal.
    ///
    /// Workers subscribe to it; a worker hitting an unrecoverable error may
    /// trigger it to stop the whole bridge.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Spawn a worker task.
    ///
    /// The task is expected to observe the shutdown signal; it is joined on
    /// shutdown and aborted only if it overruns [`JOIN_TIMEOUT`].
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.push((name.into(), handle));
    }

    /// Spawn a worker task that returns a Result.
    ///
    /// Errors are logged and trigger bridge shutdown.
    pub fn spawn_with_error<F, E>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let worker = name.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::error!(worker = %worker, error = %e, "Worker failed, shutting down bridge");
                shutdown.trigger();
            }
        });
        self.tasks.push((name, handle));
    }

    /// Run the bridge until a shutdown signal is received.
    ///
    /// This will:
    /// 1. Publish "running" status (if enabled)
    /// 2. Wait for Ctrl+C, SIGTERM or an internal shutdown request
    /// 3. Broadcast shutdown and join all spawned tasks and drain tasks
    /// 4. Publish "offline" status (if enabled)
    /// 5. Close the Zenoh session
    pub async fn run(self) -> Result<()> {
        self.run_with_metadata(None).await
    }

    /// Run the bridge with custom status metadata.
    pub async fn run_with_metadata(self, metadata: Option<serde_json::Value>) -> Result<()> {
        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_running(metadata).await {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        }

        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        let mut internal = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(bridge = %self.name, "Received Ctrl+C, shutting down...");
            }
            _ = terminate_signal() => {
                tracing::info!(bridge = %self.name, "Received SIGTERM, shutting down...");
            }
            _ = wait_for_shutdown(&mut internal) => {
                tracing::info!(bridge = %self.name, "Shutdown requested by a worker");
            }
        }

        self.shutdown.trigger();

        for (name, mut task) in self.tasks {
            match tokio::time::timeout(JOIN_TIMEOUT, &mut task).await {
                Ok(Ok(())) => tracing::debug!(task = %name, "Task stopped"),
                Ok(Err(e)) => tracing::error!(task = %name, error = %e, "Task failed"),
                Err(_) => {
                    tracing::warn!(task = %name, "Task did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        if tokio::time::timeout(JOIN_TIMEOUT, self.outbox.join())
            .await
            .is_err()
        {
            tracing::warn!("Drain tasks did not stop in time");
        }

        for (topic, stats) in self.outbox.stats() {
            tracing::info!(
                topic = %topic,
                enqueued = stats.enqueued,
                delivered = stats.delivered,
                dropped = stats.dropped,
                failed = stats.failed,
                "Final queue statistics"
            );
        }

        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_offline().await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        if let Err(e) = self.session.close().await {
            tracing::warn!(error = %e, "Error closing Zenoh session");
        }

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}

/// Resolve on SIGTERM (Unix only; pending forever elsewhere).
async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
