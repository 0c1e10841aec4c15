//! Zenoh bridge for SunSpec inverters.
//!
//! Polls one SunSpec device over Modbus and publishes its values, events,
//! identity and availability to Zenoh.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use solarsight_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
use solarsight_common::Channel;
use zenoh_bridge_sunspec::config::SunspecBridgeConfig;
use zenoh_bridge_sunspec::gateway::ModbusGateway;
use zenoh_bridge_sunspec::poller::{ConnectionState, DevicePoller, PollerConfig};

/// How long the final availability document may take to publish.
const FINAL_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("sunspec.json5");

    let config = SunspecBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut runner = BridgeRunner::new_with_args("sunspec", config, Some(&args))
        .await
        .context("Failed to start bridge")?
        .with_status_publishing();

    info!("Loaded configuration from {:?}", args.config);

    let sunspec = runner.config().sunspec.clone();
    let device = sunspec.device.clone();
    let keys = runner.keys().clone();
    let outbox = runner.outbox();

    info!(
        device = %device.name,
        connection = %device.connection,
        unit_id = device.unit_id,
        "Starting SunSpec poller"
    );

    let gateway = Arc::new(ModbusGateway::new(device.clone()));
    let poller = DevicePoller::new(gateway, PollerConfig::from_sunspec(&sunspec));

    poller.on_values(outbox.producer(&keys.build(&device.name, Channel::Values)));
    poller.on_events(outbox.producer(&keys.build(&device.name, Channel::Events)));
    poller.on_device(outbox.producer(&keys.build(&device.name, Channel::Device)));

    // The final "offline" document bypasses the queue: drain tasks stop with
    // the bridge, so it is published directly once the poller has finished.
    let handle = poller.handle();
    let availability_key = keys.build(&device.name, Channel::Availability);
    let enqueue_availability = outbox.producer(&availability_key);
    let live = handle.clone();
    poller.on_availability(move |document| {
        if live.state() != ConnectionState::Shutdown {
            enqueue_availability(document);
        }
    });

    let sink = runner.sink();
    let shutdown = runner.shutdown_handle().subscribe();
    runner.spawn_with_error("poller", async move {
        let result = poller.run(shutdown).await;

        if let Some(document) = handle.availability_document() {
            match tokio::time::timeout(
                FINAL_PUBLISH_TIMEOUT,
                sink.publish(&availability_key, &document),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to publish final availability"),
                Err(_) => warn!("Timed out publishing final availability"),
            }
        }

        result
    });

    let metadata = serde_json::json!({
        "device": device.name,
        "connection": device.connection.to_string(),
        "update_interval_secs": sunspec.update_interval_secs,
    });

    runner.run_with_metadata(Some(metadata)).await?;

    Ok(())
}
