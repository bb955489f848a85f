// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilient publisher: a non-blocking front over a bounded queue, drained
//! to the message bus by one worker task.
//!
//! ```text
//! producers ──try_send──▶ [bounded mpsc] ──recv──▶ DrainWorker ──▶ MessageBus
//!              (full: drop newest)                 (Disconnected: gated reconnect)
//! ```
//!
//! Nothing here is persisted. Messages are lost on overflow, on a dead
//! link, or on shutdown; producers never see an error and never wait.

pub mod bus;
pub mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub use bus::{BusError, MemoryBus, MessageBus, RedisBus};
pub use worker::{Delivery, DrainWorker, PublisherHandle};

/// One message on its way to the bus; owned by the queue until drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination_key: String,
    pub payload: Vec<u8>,
    pub exchange: String,
}

impl OutboundMessage {
    /// Bus channel: `{exchange}.{destination_key}`
    #[must_use]
    pub fn topic(&self) -> String {
        format!("{}.{}", self.exchange, self.destination_key)
    }
}

/// Connection state of the drain worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

#[derive(Default)]
pub(crate) struct PublisherStats {
    enqueued: AtomicU64,
    dropped_full: AtomicU64,
    dropped_disconnected: AtomicU64,
    dropped_publish_error: AtomicU64,
    published: AtomicU64,
}

impl PublisherStats {
    pub(crate) fn record(&self, counter: &AtomicU64, outcome: &str) {
        counter.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_publish(outcome);
    }

    fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            dropped_disconnected: self.dropped_disconnected.load(Ordering::Relaxed),
            dropped_publish_error: self.dropped_publish_error.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
        }
    }
}

/// Publisher counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStatsSnapshot {
    pub enqueued: u64,
    pub dropped_full: u64,
    pub dropped_disconnected: u64,
    pub dropped_publish_error: u64,
    pub published: u64,
}

impl PublisherStatsSnapshot {
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped_full + self.dropped_disconnected + self.dropped_publish_error
    }
}

/// Producer side. Cheap to clone; every clone feeds the same queue.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<OutboundMessage>,
    exchange: Arc<str>,
    capacity: usize,
    stats: Arc<PublisherStats>,
    connected: Arc<AtomicBool>,
}

impl Publisher {
    /// Build the queue and its (not yet running) drain worker.
    pub fn channel(
        bus: Box<dyn MessageBus>,
        exchange: &str,
        capacity: usize,
        reconnect_interval: Duration,
    ) -> (Self, DrainWorker) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(PublisherStats::default());
        let connected = Arc::new(AtomicBool::new(false));

        let publisher = Self {
            tx,
            exchange: Arc::from(exchange),
            capacity,
            stats: Arc::clone(&stats),
            connected: Arc::clone(&connected),
        };
        let worker = DrainWorker::new(rx, bus, reconnect_interval, stats, connected);
        (publisher, worker)
    }

    /// Queue a message for the bus. Never blocks.
    ///
    /// Returns whether the message was accepted; a full or closed queue drops it.
    pub fn publish(&self, destination_key: &str, payload: Vec<u8>) -> bool {
        let message = OutboundMessage {
            destination_key: destination_key.to_string(),
            payload,
            exchange: self.exchange.to_string(),
        };

        match self.tx.try_send(message) {
            Ok(()) => {
                self.stats.record(&self.stats.enqueued, "enqueued");
                crate::metrics::set_publish_queue_depth(self.queue_len());
                true
            }
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    destination = %dropped.destination_key,
                    capacity = self.capacity,
                    "Publish queue full; dropping message"
                );
                self.stats.record(&self.stats.dropped_full, "dropped_full");
                false
            }
            Err(TrySendError::Closed(dropped)) => {
                debug!(destination = %dropped.destination_key, "Publisher stopped; dropping message");
                self.stats.record(&self.stats.dropped_disconnected, "dropped_disconnected");
                false
            }
        }
    }

    /// Messages waiting for the worker.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn link_state(&self) -> LinkState {
        if self.connected.load(Ordering::Acquire) {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    #[must_use]
    pub fn stats(&self) -> PublisherStatsSnapshot {
        self.stats.snapshot()
    }
}
