// SPDX-License-Identifier: MIT OR Apache-2.0
//! Forwarding bridge to an external broker.
//!
//! Published envelopes are serialised to the JSON wire form and written as
//! one line each over a TCP connection. The bridge sits behind a bounded
//! drop-oldest queue: local subscribers are never blocked by a slow or
//! absent broker, and overflow is counted rather than propagated.

use afc_core::Envelope;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Default bound on the forwarding queue.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Base delay for reconnect backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Cap on the reconnect backoff delay.
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Snapshot of broker forwarding statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    /// Envelopes accepted into the forwarding queue.
    pub enqueued: u64,
    /// Envelopes written to the broker.
    pub forwarded: u64,
    /// Envelopes discarded because the queue overflowed.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    stopped: AtomicBool,
    enqueued: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

/// Bridge forwarding envelopes to `broker_url` as TCP JSON lines.
#[derive(Debug)]
pub struct BrokerBridge {
    shared: Arc<Shared>,
    capacity: usize,
}

impl BrokerBridge {
    /// Start a bridge forwarding to `broker_url` (`host:port`).
    ///
    /// The forwarder task runs until [`stop`](Self::stop) is called; while
    /// the broker is unreachable it retries with exponential backoff and
    /// the queue keeps absorbing (and, at capacity, shedding) envelopes.
    #[must_use]
    pub fn connect(broker_url: impl Into<String>) -> Self {
        Self::with_capacity(broker_url, DEFAULT_QUEUE_CAPACITY)
    }

    /// Start a bridge with an explicit queue bound.
    #[must_use]
    pub fn with_capacity(broker_url: impl Into<String>, capacity: usize) -> Self {
        let shared = Arc::new(Shared::default());
        tokio::spawn(forwarder_task(broker_url.into(), Arc::clone(&shared)));
        Self { shared, capacity }
    }

    /// Queue an envelope for forwarding, shedding the oldest entry on
    /// overflow.
    pub fn enqueue(&self, env: &Envelope) {
        let Ok(line) = env.to_wire() else {
            // The bus validated the payload already; an unserialisable
            // envelope here counts as shed load.
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        {
            let mut queue = self.shared.queue.lock().expect("broker queue poisoned");
            queue.push_back(line);
            if queue.len() > self.capacity {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: "afc.bus.broker", "forward queue overflow, oldest dropped");
            }
        }
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.notify.notify_one();
    }

    /// Snapshot of forwarding statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            forwarded: self.shared.forwarded.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the forwarder task. Idempotent.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }
}

/// Exponential reconnect delay for a zero-indexed attempt.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = 2u32.saturating_pow(attempt.min(16));
    BACKOFF_BASE.saturating_mul(exp).min(BACKOFF_MAX)
}

async fn forwarder_task(url: String, shared: Arc<Shared>) {
    let mut conn: Option<TcpStream> = None;
    let mut failed_attempts: u32 = 0;

    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }

        let line = {
            let mut queue = shared.queue.lock().expect("broker queue poisoned");
            queue.pop_front()
        };
        let Some(line) = line else {
            shared.notify.notified().await;
            continue;
        };

        loop {
            if shared.stopped.load(Ordering::SeqCst) {
                return;
            }
            if conn.is_none() {
                match TcpStream::connect(&url).await {
                    Ok(stream) => {
                        debug!(target: "afc.bus.broker", %url, "broker connected");
                        conn = Some(stream);
                        failed_attempts = 0;
                    }
                    Err(e) => {
                        let delay = backoff_delay(failed_attempts);
                        failed_attempts = failed_attempts.saturating_add(1);
                        warn!(
                            target: "afc.bus.broker",
                            %url,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "broker unreachable, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
            }
            let stream = conn.as_mut().expect("connection just established");
            match stream.write_all(format!("{line}\n").as_bytes()).await {
                Ok(()) => {
                    shared.forwarded.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    warn!(target: "afc.bus.broker", error = %e, "broker write failed, reconnecting");
                    conn = None;
                }
            }
        }
    }
}
