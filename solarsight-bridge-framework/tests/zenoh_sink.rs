//! End-to-end tests of the Zenoh sink.
//!
//! Note: Zenoh requires multi-thread tokio runtime.
//! Each test uses a unique key prefix to avoid interference.

use std::sync::Arc;
use std::time::Duration;

use solarsight_bridge_framework::{
    MessageSink, OutboundMessage, Outbox, QueueConfig, ShutdownHandle, ZenohMode, ZenohSink,
};

/// Generate a unique test prefix to avoid test interference.
fn unique_prefix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("test_{}", nanos)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_sink_is_connected_and_publishes() {
    let prefix = unique_prefix();
    let session = Arc::new(
        zenoh::open(zenoh::Config::default())
            .await
            .expect("Failed to open Zenoh session"),
    );

    let subscriber = session
        .declare_subscriber(format!("{}/**", prefix))
        .await
        .expect("Failed to create subscriber");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sink = ZenohSink::new(session.clone(), ZenohMode::Peer);
    assert!(sink.is_connected());
    assert!(*sink.connectivity().borrow());

    let key = format!("{}/inverter01/values", prefix);
    sink.publish(&key, r#"{"time":1}"#)
        .await
        .expect("Failed to publish");

    let sample = tokio::time::timeout(Duration::from_secs(5), subscriber.recv_async())
        .await
        .expect("Timeout waiting for message")
        .expect("Failed to receive");

    assert_eq!(sample.key_expr().as_str(), key);
    let payload = sample
        .payload()
        .try_to_string()
        .expect("payload should be UTF-8");
    assert_eq!(payload, r#"{"time":1}"#);

    session.close().await.expect("Failed to close session");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_outbox_over_zenoh() {
    let prefix = unique_prefix();
    let session = Arc::new(
        zenoh::open(zenoh::Config::default())
            .await
            .expect("Failed to open Zenoh session"),
    );

    let subscriber = session
        .declare_subscriber(format!("{}/**", prefix))
        .await
        .expect("Failed to create subscriber");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sink = Arc::new(ZenohSink::new(session.clone(), ZenohMode::Peer));
    let shutdown = ShutdownHandle::new();
    let outbox = Outbox::new(sink, QueueConfig::default(), shutdown.subscribe()).unwrap();

    let key = format!("{}/inverter01/availability", prefix);
    outbox.enqueue(OutboundMessage::new(&key, r#"{"status":"online","time":1}"#));

    let sample = tokio::time::timeout(Duration::from_secs(5), subscriber.recv_async())
        .await
        .expect("Timeout waiting for message")
        .expect("Failed to receive");
    assert_eq!(sample.key_expr().as_str(), key);

    shutdown.trigger();
    outbox.join().await;
    session.close().await.expect("Failed to close session");
}
