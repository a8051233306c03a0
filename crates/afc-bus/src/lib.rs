// SPDX-License-Identifier: MIT OR Apache-2.0
//! afc-bus
//!
//! Topic-keyed envelope fan-out with an optional external broker bridge.
//!
//! Delivery guarantees: for a single `(publisher, topic)` pair envelopes
//! arrive in publish order; nothing is guaranteed across topics or
//! publishers. Synchronous handlers run inline on the publisher's task;
//! asynchronous subscribers drain a per-subscription queue.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// External broker forwarding over TCP JSON-lines.
pub mod broker;

pub use broker::{BrokerBridge, BrokerStats};

use afc_core::{Envelope, ErrorCode};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Errors surfaced at publish time.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The payload is not JSON-serialisable or exceeds the size cap.
    #[error("invalid payload: {detail}")]
    InvalidPayload {
        /// What the validator objected to.
        detail: String,
    },
}

impl BusError {
    /// Stable code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidPayload
    }
}

type SyncHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

enum Subscriber {
    Sync(SyncHandler),
    Queue(mpsc::UnboundedSender<Envelope>),
}

#[derive(Debug, Default)]
struct Stats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of bus delivery statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    /// Envelopes accepted by [`Bus::publish`].
    pub published: u64,
    /// Individual subscriber deliveries.
    pub delivered: u64,
    /// Deliveries lost to closed subscriber queues.
    pub dropped: u64,
}

/// In-process publish/subscribe dispatcher.
///
/// Cheap to share behind an `Arc`; subscription and publish take the topic
/// lock only long enough to snapshot the subscriber list.
pub struct Bus {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    stats: Stats,
    max_payload: usize,
    broker: Option<BrokerBridge>,
}

impl Bus {
    /// Create a bus with the default payload cap and no broker bridge.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            stats: Stats::default(),
            max_payload: afc_core::DEFAULT_MAX_PAYLOAD_BYTES,
            broker: None,
        }
    }

    /// Override the serialised-payload cap.
    #[must_use]
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Attach an external broker bridge.
    #[must_use]
    pub fn with_broker(mut self, broker: BrokerBridge) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Subscribe a synchronous handler that runs inline on the publisher's
    /// task.
    pub fn subscribe(&self, topic: &str, handler: impl Fn(&Envelope) + Send + Sync + 'static) {
        self.push_subscriber(topic, Subscriber::Sync(Arc::new(handler)));
    }

    /// Subscribe an asynchronous handler.
    ///
    /// Envelopes are queued per subscription and handled by one consumer
    /// task, so this subscriber observes per-topic publish order.
    pub fn subscribe_async<F, Fut>(&self, topic: &str, mut handler: F)
    where
        F: FnMut(Envelope) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut rx = self.subscribe_channel(topic);
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                handler(env).await;
            }
        });
    }

    /// Subscribe as a raw ordered channel.
    #[must_use]
    pub fn subscribe_channel(&self, topic: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push_subscriber(topic, Subscriber::Queue(tx));
        rx
    }

    fn push_subscriber(&self, topic: &str, sub: Subscriber) {
        self.topics
            .lock()
            .expect("bus lock poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(sub);
    }

    /// Publish an envelope to every handler subscribed to `topic` at this
    /// moment, then forward to the broker bridge if one is attached.
    ///
    /// Returns the number of local deliveries.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidPayload`] when the payload fails the serialise or
    /// size check; nothing is delivered in that case.
    pub fn publish(&self, topic: &str, env: &Envelope) -> Result<usize, BusError> {
        env.check_payload(self.max_payload)
            .map_err(|e| BusError::InvalidPayload {
                detail: e.to_string(),
            })?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot so handlers subscribed mid-delivery don't see this
        // envelope, and so slow handlers don't hold the lock.
        let snapshot: Vec<Subscriber> = {
            let topics = self.topics.lock().expect("bus lock poisoned");
            topics
                .get(topic)
                .map(|subs| {
                    subs.iter()
                        .map(|s| match s {
                            Subscriber::Sync(f) => Subscriber::Sync(Arc::clone(f)),
                            Subscriber::Queue(tx) => Subscriber::Queue(tx.clone()),
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut delivered = 0;
        let mut any_closed = false;
        for sub in &snapshot {
            match sub {
                Subscriber::Sync(f) => {
                    f(env);
                    delivered += 1;
                }
                Subscriber::Queue(tx) => {
                    if tx.send(env.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        any_closed = true;
                    }
                }
            }
        }
        if any_closed {
            let mut topics = self.topics.lock().expect("bus lock poisoned");
            if let Some(subs) = topics.get_mut(topic) {
                subs.retain(|s| match s {
                    Subscriber::Queue(tx) => !tx.is_closed(),
                    Subscriber::Sync(_) => true,
                });
            }
        }
        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        debug!(target: "afc.bus", topic, delivered, "published");

        if let Some(broker) = &self.broker {
            broker.enqueue(env);
        }
        Ok(delivered)
    }

    /// Number of subscribers currently attached to `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .expect("bus lock poisoned")
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Snapshot of delivery statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    /// Broker forwarding statistics, when a bridge is attached.
    #[must_use]
    pub fn broker_stats(&self) -> Option<BrokerStats> {
        self.broker.as_ref().map(BrokerBridge::stats)
    }

    /// Stop the broker forwarder, if any. Local delivery is unaffected.
    pub fn close(&self) {
        if let Some(broker) = &self.broker {
            broker.stop();
        } else {
            warn!(target: "afc.bus", "close called without a broker bridge");
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afc_core::Payload;

    fn env_with(n: i64) -> Envelope {
        let mut payload = Payload::new();
        payload.insert("n", n);
        Envelope::new("tester", "t").with_payload(payload)
    }

    #[tokio::test]
    async fn sync_handlers_observe_publish_order() {
        let bus = Bus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe("t", move |env| {
            sink.lock()
                .unwrap()
                .push(env.payload.get("n").unwrap().as_i64().unwrap());
        });
        for n in 0..50 {
            bus.publish("t", &env_with(n)).unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn async_subscriber_observes_publish_order() {
        let bus = Bus::new();
        let mut rx = bus.subscribe_channel("t");
        for n in 0..50 {
            bus.publish("t", &env_with(n)).unwrap();
        }
        drop(bus);
        let mut seen = Vec::new();
        while let Some(env) = rx.recv().await {
            seen.push(env.payload.get("n").unwrap().as_i64().unwrap());
        }
        assert_eq!(seen, (0..50).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn async_handlers_run_on_the_scheduler_in_order() {
        let bus = Bus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let sink = Arc::clone(&seen);
        bus.subscribe_async("t", move |env: Envelope| {
            let sink = Arc::clone(&sink);
            let done = done_tx.clone();
            async move {
                tokio::task::yield_now().await;
                let n = env.payload.get("n").unwrap().as_i64().unwrap();
                sink.lock().unwrap().push(n);
                if n == 9 {
                    let _ = done.send(());
                }
            }
        });
        for n in 0..10 {
            bus.publish("t", &env_with(n)).unwrap();
        }
        done_rx.recv().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn subscribers_added_later_miss_earlier_publishes() {
        let bus = Bus::new();
        bus.publish("t", &env_with(1)).unwrap();
        let count = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&count);
        bus.subscribe("t", move |_| {
            sink.fetch_add(1, Ordering::Relaxed);
        });
        bus.publish("t", &env_with(2)).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = Bus::new();
        let count = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&count);
        bus.subscribe("a", move |_| {
            sink.fetch_add(1, Ordering::Relaxed);
        });
        bus.publish("b", &env_with(1)).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let bus = Bus::new().with_max_payload(64);
        let mut payload = Payload::new();
        payload.insert("data", "x".repeat(128));
        let env = Envelope::new("s", "t").with_payload(payload);
        let err = bus.publish("t", &env).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
        assert_eq!(bus.stats().published, 0);
    }

    #[tokio::test]
    async fn empty_payload_is_accepted() {
        let bus = Bus::new();
        bus.publish("t", &Envelope::new("s", "t")).unwrap();
        assert_eq!(bus.stats().published, 1);
    }

    #[tokio::test]
    async fn closed_queue_counts_as_dropped_and_is_pruned() {
        let bus = Bus::new();
        let rx = bus.subscribe_channel("t");
        drop(rx);
        assert_eq!(bus.subscriber_count("t"), 1);
        bus.publish("t", &env_with(1)).unwrap();
        assert_eq!(bus.stats().dropped, 1);
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn delivery_count_covers_all_subscribers() {
        let bus = Bus::new();
        bus.subscribe("t", |_| {});
        bus.subscribe("t", |_| {});
        let _rx = bus.subscribe_channel("t");
        let delivered = bus.publish("t", &env_with(1)).unwrap();
        assert_eq!(delivered, 3);
        assert_eq!(bus.subscriber_count("t"), 3);
    }
}
