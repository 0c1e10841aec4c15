//! Bounded outbound queue.
//!
//! Each destination (topic) owns a FIFO bounded at a fixed capacity and one
//! drain task. Producers never block: when the FIFO is full the oldest entry
//! is evicted before the new one is appended. The drain task delivers from
//! the head only while the sink reports itself connected; a failed delivery
//! leaves the head in place so it is retried in the next connectivity window.
//!
//! ```text
//! producer ──enqueue──▶ [ oldest … newest ] ──drain task──▶ MessageSink
//!                         ▲ evicted on overflow
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::QueueConfig;
use crate::error::{BridgeError, Result};
use crate::shutdown::{is_shutdown, wait_for_shutdown};
use crate::sink::MessageSink;

/// A serialized document addressed to a destination topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Lifetime counters of one destination queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages accepted by `enqueue`.
    pub enqueued: u64,
    /// Messages delivered to the sink.
    pub delivered: u64,
    /// Messages evicted by overflow.
    pub dropped: u64,
    /// Failed delivery attempts.
    pub failed: u64,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    message: Arc<OutboundMessage>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<Entry>,
    next_seq: u64,
    /// Evictions in the current backlog episode; reset when the queue drains.
    episode_dropped: u64,
    stats: QueueStats,
}

/// FIFO for a single destination, drained by one task.
#[derive(Debug)]
pub struct DestinationQueue {
    topic: String,
    capacity: usize,
    retry_interval: Duration,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DestinationQueue {
    /// Create a queue for `topic`. A capacity of 0 is raised to 1.
    pub fn new(topic: impl Into<String>, capacity: usize, retry_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            topic: topic.into(),
            capacity,
            retry_interval,
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                ..QueueState::default()
            }),
            notify: Notify::new(),
        }
    }

    /// Destination topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Maximum number of queued messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a message, evicting the oldest one if the queue is full.
    ///
    /// Never blocks on delivery. Returns `true` if an entry was evicted.
    pub fn enqueue(&self, message: OutboundMessage) -> bool {
        let (evicted, len, episode_dropped) = {
            let mut state = self.state.lock();
            let evicted = if state.entries.len() >= self.capacity {
                state.entries.pop_front();
                state.episode_dropped += 1;
                state.stats.dropped += 1;
                true
            } else {
                false
            };

            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push_back(Entry {
                seq,
                message: Arc::new(message),
            });
            state.stats.enqueued += 1;

            (evicted, state.entries.len(), state.episode_dropped)
        };

        if evicted {
            tracing::warn!(
                topic = %self.topic,
                dropped = episode_dropped,
                "Outbound queue full, dropped oldest message"
            );
        } else if len > 1 {
            tracing::debug!(topic = %self.topic, queued = len, "Messages waiting for delivery");
        }

        self.notify.notify_one();
        evicted
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Evictions since the queue was last drained empty.
    pub fn dropped(&self) -> u64 {
        self.state.lock().episode_dropped
    }

    /// Lifetime counters.
    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    /// Copy of the queued messages, oldest first.
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|entry| entry.message.as_ref().clone())
            .collect()
    }

    fn head(&self) -> Option<(u64, Arc<OutboundMessage>)> {
        self.state
            .lock()
            .entries
            .front()
            .map(|entry| (entry.seq, Arc::clone(&entry.message)))
    }

    /// Remove the delivered head entry.
    ///
    /// The entry may already be gone if an overflow evicted it while it was in
    /// flight; in that case nothing else is removed.
    fn complete(&self, seq: u64) {
        let mut state = self.state.lock();
        if state.entries.front().is_some_and(|entry| entry.seq == seq) {
            state.entries.pop_front();
        }
        state.stats.delivered += 1;

        if state.entries.is_empty() && state.episode_dropped > 0 {
            tracing::info!(
                topic = %self.topic,
                dropped = state.episode_dropped,
                "Outbound backlog drained"
            );
            state.episode_dropped = 0;
        }
    }

    fn record_failure(&self) {
        self.state.lock().stats.failed += 1;
    }

    /// Drain loop. Runs until shutdown is requested.
    ///
    /// Waits for the sink to be connected, then for a message, then delivers
    /// from the head while both hold. Messages still queued at shutdown are
    /// discarded.
    pub async fn run(&self, sink: &dyn MessageSink, mut shutdown: watch::Receiver<bool>) {
        let mut connectivity = sink.connectivity();

        'outer: loop {
            if is_shutdown(&shutdown) {
                break;
            }

            // Wait until connected.
            if !*connectivity.borrow_and_update() {
                tracing::debug!(topic = %self.topic, queued = self.len(), "Waiting for sink connection");
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    closed = async { connectivity.wait_for(|c| *c).await.is_err() } => {
                        if closed {
                            tracing::warn!(topic = %self.topic, sink = sink.name(), "Sink went away, stopping drain");
                            break;
                        }
                    }
                }
            }

            // Wait until there is something to deliver.
            while self.is_empty() {
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => break 'outer,
                    _ = self.notify.notified() => {}
                }
            }

            // Deliver from the head while connected.
            let mut failed = false;
            while !is_shutdown(&shutdown) && *connectivity.borrow() {
                let Some((seq, message)) = self.head() else {
                    break;
                };

                match sink.publish(&message.topic, &message.payload).await {
                    Ok(()) => {
                        tracing::trace!(topic = %message.topic, payload = %message.payload, "Published");
                        self.complete(seq);
                    }
                    Err(e) => {
                        tracing::warn!(topic = %message.topic, error = %e, "Delivery failed, keeping message queued");
                        self.record_failure();
                        failed = true;
                        break;
                    }
                }
            }

            if failed {
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            tracing::warn!(topic = %self.topic, sink = sink.name(), "Sink went away, stopping drain");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.retry_interval) => {}
                }
            }
        }

        tracing::debug!(topic = %self.topic, discarded = self.len(), "Drain loop stopped");
    }
}

/// Set of destination queues sharing one sink and one shutdown signal.
pub struct Outbox {
    sink: Arc<dyn MessageSink>,
    config: QueueConfig,
    shutdown: watch::Receiver<bool>,
    runtime: Handle,
    destinations: Mutex<HashMap<String, Arc<DestinationQueue>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("sink", &self.sink.name())
            .field("config", &self.config)
            .field("destinations", &self.destinations.lock().len())
            .finish()
    }
}

impl Outbox {
    /// Create an outbox. Must be called from within a tokio runtime; drain
    /// tasks are spawned on that runtime.
    pub fn new(
        sink: Arc<dyn MessageSink>,
        config: QueueConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| BridgeError::worker(format!("Outbox requires a tokio runtime: {}", e)))?;

        Ok(Self {
            sink,
            config,
            shutdown,
            runtime,
            destinations: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Get the queue for `topic`, creating it and its drain task on first use.
    pub fn destination(&self, topic: &str) -> Arc<DestinationQueue> {
        let mut destinations = self.destinations.lock();
        if let Some(queue) = destinations.get(topic) {
            return Arc::clone(queue);
        }

        let queue = Arc::new(DestinationQueue::new(
            topic,
            self.config.capacity,
            self.config.retry_interval(),
        ));
        destinations.insert(topic.to_string(), Arc::clone(&queue));
        drop(destinations);

        let drain_queue = Arc::clone(&queue);
        let sink = Arc::clone(&self.sink);
        let shutdown = self.shutdown.clone();
        let span = tracing::debug_span!("drain", topic = %topic);
        let handle = self.runtime.spawn(
            async move {
                drain_queue.run(sink.as_ref(), shutdown).await;
            }
            .instrument(span),
        );
        self.tasks.lock().push(handle);

        tracing::debug!(topic = %topic, capacity = self.config.capacity, "Destination registered");
        queue
    }

    /// Route a message to its destination queue.
    pub fn enqueue(&self, message: OutboundMessage) -> bool {
        self.destination(&message.topic).enqueue(message)
    }

    /// Build a producer callback bound to `topic`.
    ///
    /// The callback takes a serialized document and enqueues it; it never blocks.
    pub fn producer(&self, topic: &str) -> impl Fn(String) + Send + Sync + 'static {
        let queue = self.destination(topic);
        move |payload: String| {
            queue.enqueue(OutboundMessage::new(queue.topic(), payload));
        }
    }

    /// Per-destination lifetime counters, sorted by topic.
    pub fn stats(&self) -> Vec<(String, QueueStats)> {
        let mut stats: Vec<_> = self
            .destinations
            .lock()
            .iter()
            .map(|(topic, queue)| (topic.clone(), queue.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Wait for every drain task to finish.
    ///
    /// Shutdown must already have been requested through the signal passed to
    /// [`new`](Self::new), otherwise this waits indefinitely.
    pub async fn join(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Drain task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> DestinationQueue {
        DestinationQueue::new("solar/inv/values", capacity, Duration::from_millis(10))
    }

    fn msg(payload: &str) -> OutboundMessage {
        OutboundMessage::new("solar/inv/values", payload)
    }

    fn payloads(queue: &DestinationQueue) -> Vec<String> {
        queue.messages().into_iter().map(|m| m.payload).collect()
    }

    #[test]
    fn test_enqueue_below_capacity() {
        let queue = queue(3);
        assert!(!queue.enqueue(msg("a")));
        assert!(!queue.enqueue(msg("b")));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 0);
        assert_eq!(payloads(&queue), vec!["a", "b"]);
    }

    #[test]
    fn test_overflow_keeps_last_n_in_order() {
        for capacity in 1..=8 {
            let queue = queue(capacity);
            for i in 0..=capacity {
                queue.enqueue(msg(&i.to_string()));
            }

            let expected: Vec<String> = (1..=capacity).map(|i| i.to_string()).collect();
            assert_eq!(payloads(&queue), expected, "capacity {}", capacity);
            assert_eq!(queue.dropped(), 1);
            assert_eq!(queue.len(), capacity);
        }
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let queue = queue(4);
        for i in 0..100 {
            queue.enqueue(msg(&i.to_string()));
            assert!(queue.len() <= 4);
        }
        assert_eq!(queue.dropped(), 96);
        assert_eq!(queue.stats().enqueued, 100);
    }

    #[test]
    fn test_zero_capacity_raised_to_one() {
        let queue = queue(0);
        queue.enqueue(msg("a"));
        queue.enqueue(msg("b"));
        assert_eq!(payloads(&queue), vec!["b"]);
    }

    #[test]
    fn test_complete_resets_drop_counter_when_empty() {
        let queue = queue(1);
        queue.enqueue(msg("a"));
        queue.enqueue(msg("b"));
        assert_eq!(queue.dropped(), 1);

        let (seq, head) = queue.head().unwrap();
        assert_eq!(head.payload, "b");
        queue.complete(seq);

        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 0);
        assert_eq!(queue.stats().dropped, 1);
        assert_eq!(queue.stats().delivered, 1);
    }

    #[test]
    fn test_complete_after_eviction_keeps_new_head() {
        let queue = queue(1);
        queue.enqueue(msg("in-flight"));
        let (seq, _) = queue.head().unwrap();

        // Evicted while being delivered.
        queue.enqueue(msg("newer"));
        queue.complete(seq);

        assert_eq!(payloads(&queue), vec!["newer"]);
        assert_eq!(queue.dropped(), 1);
    }
}
