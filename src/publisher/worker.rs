// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The single consumer of the publish queue.
//!
//! The worker is the only mutator of the link state. While disconnected it
//! tries to reconnect at most once per `reconnect_interval`; messages that
//! arrive while the link is down or gated are dropped, not held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bus::{BusError, MessageBus};
use super::{LinkState, OutboundMessage, PublisherStats};

/// What happened to one drained message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Published,
    /// Link down and reconnect gated or failed
    DroppedDisconnected,
    /// The bus refused the message
    DroppedPublishError(BusError),
}

pub struct DrainWorker {
    rx: mpsc::Receiver<OutboundMessage>,
    bus: Box<dyn MessageBus>,
    state: LinkState,
    last_attempt: Option<Instant>,
    reconnect_interval: Duration,
    stats: Arc<PublisherStats>,
    connected: Arc<AtomicBool>,
}

impl DrainWorker {
    pub(crate) fn new(
        rx: mpsc::Receiver<OutboundMessage>,
        bus: Box<dyn MessageBus>,
        reconnect_interval: Duration,
        stats: Arc<PublisherStats>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rx,
            bus,
            state: LinkState::Disconnected,
            last_attempt: None,
            reconnect_interval,
            stats,
            connected,
        }
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    fn set_state(&mut self, state: LinkState) {
        self.state = state;
        self.connected
            .store(state == LinkState::Connected, Ordering::Release);
    }

    /// Connect if disconnected and the gate allows. Returns whether the link is up.
    async fn ensure_connected(&mut self) -> bool {
        if self.state == LinkState::Connected {
            return true;
        }
        if let Some(last) = self.last_attempt {
            if last.elapsed() < self.reconnect_interval {
                return false;
            }
        }

        self.last_attempt = Some(Instant::now());
        match self.bus.connect().await {
            Ok(()) => {
                info!("Message bus connected");
                self.set_state(LinkState::Connected);
                crate::metrics::record_bus_connect(true);
                true
            }
            Err(e) => {
                warn!(error = %e, retry_in = ?self.reconnect_interval, "Message bus connect failed");
                crate::metrics::record_bus_connect(false);
                false
            }
        }
    }

    /// Push one message through the link.
    pub async fn deliver(&mut self, message: OutboundMessage) -> Delivery {
        if !self.ensure_connected().await {
            debug!(destination = %message.destination_key, "Bus disconnected; dropping message");
            self.stats
                .record(&self.stats.dropped_disconnected, "dropped_disconnected");
            return Delivery::DroppedDisconnected;
        }

        match self.bus.publish(&message.topic(), &message.payload).await {
            Ok(()) => {
                self.stats.record(&self.stats.published, "published");
                Delivery::Published
            }
            Err(e) => {
                warn!(destination = %message.destination_key, error = %e, "Publish failed; dropping message");
                if matches!(e, BusError::Connection(_)) {
                    self.set_state(LinkState::Disconnected);
                    crate::metrics::set_bus_disconnected();
                }
                self.stats
                    .record(&self.stats.dropped_publish_error, "dropped_publish_error");
                Delivery::DroppedPublishError(e)
            }
        }
    }

    /// Drain at most one queued message without waiting.
    ///
    /// Returns `None` when the queue is empty.
    pub async fn step(&mut self) -> Option<Delivery> {
        let message = self.rx.try_recv().ok()?;
        Some(self.deliver(message).await)
    }

    /// Drain until stopped or every producer is gone. Queued messages are
    /// not flushed on stop.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!("Publisher drain worker started");
        if !*stop.borrow() {
            self.ensure_connected().await;
        }

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                message = self.rx.recv() => match message {
                    Some(message) => {
                        self.deliver(message).await;
                        crate::metrics::set_publish_queue_depth(self.rx.len());
                    }
                    None => break,
                },
            }
        }

        let abandoned = self.rx.len();
        self.bus.close().await;
        self.set_state(LinkState::Disconnected);
        crate::metrics::set_bus_disconnected();
        info!(abandoned, "Publisher drain worker stopped");
    }

    /// Run on a tokio task and return a handle that can stop it.
    pub fn spawn(self) -> PublisherHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        PublisherHandle { stop_tx, task }
    }
}

/// Stops a spawned drain worker.
pub struct PublisherHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PublisherHandle {
    /// Signal stop and wait for the worker to close the connection.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Publisher drain task ended abnormally");
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{MemoryBus, Publisher};

    fn channel(bus: &MemoryBus, capacity: usize) -> (Publisher, DrainWorker) {
        Publisher::channel(Box::new(bus.clone()), "sensors", capacity, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_publishes_in_order() {
        let bus = MemoryBus::new(true);
        let (publisher, mut worker) = channel(&bus, 10);

        for i in 0..3u8 {
            publisher.publish("gas_readings", vec![i]);
        }
        while let Some(delivery) = worker.step().await {
            assert_eq!(delivery, Delivery::Published);
        }

        let payloads: Vec<Vec<u8>> = bus.published().into_iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, vec![vec![0], vec![1], vec![2]]);
        assert_eq!(worker.state(), LinkState::Connected);
        assert_eq!(publisher.link_state(), LinkState::Connected);
        assert_eq!(publisher.stats().published, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_on_empty_queue() {
        let bus = MemoryBus::new(true);
        let (_publisher, mut worker) = channel(&bus, 10);
        assert!(worker.step().await.is_none());
        assert_eq!(bus.connect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_gated() {
        let bus = MemoryBus::new(false);
        let (publisher, mut worker) = channel(&bus, 10);

        for i in 0..3u8 {
            publisher.publish("k", vec![i]);
        }
        // First message pays for a connect attempt, the rest are gated
        assert_eq!(worker.step().await, Some(Delivery::DroppedDisconnected));
        assert_eq!(worker.step().await, Some(Delivery::DroppedDisconnected));
        assert_eq!(worker.step().await, Some(Delivery::DroppedDisconnected));
        assert_eq!(bus.connect_attempts(), 1);

        bus.set_reachable(true);
        publisher.publish("k", vec![9]);
        assert_eq!(worker.step().await, Some(Delivery::DroppedDisconnected));
        assert_eq!(bus.connect_attempts(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        publisher.publish("k", vec![10]);
        assert_eq!(worker.step().await, Some(Delivery::Published));
        assert_eq!(bus.connect_attempts(), 2);
        assert_eq!(bus.published(), vec![("sensors.k".to_string(), vec![10])]);
        assert_eq!(publisher.stats().dropped_disconnected, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_error_moves_to_disconnected() {
        let bus = MemoryBus::new(true);
        let (publisher, mut worker) = channel(&bus, 10);

        publisher.publish("k", vec![1]);
        assert_eq!(worker.step().await, Some(Delivery::Published));

        bus.set_reachable(false);
        publisher.publish("k", vec![2]);
        assert!(matches!(
            worker.step().await,
            Some(Delivery::DroppedPublishError(BusError::Connection(_)))
        ));
        assert_eq!(worker.state(), LinkState::Disconnected);
        assert_eq!(publisher.stats().dropped_publish_error, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_worker_drains_and_stops() {
        let bus = MemoryBus::new(true);
        let (publisher, worker) = channel(&bus, 10);
        let handle = worker.spawn();

        for i in 0..5u8 {
            publisher.publish("k", vec![i]);
        }
        while bus.published().len() < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.stop().await;
        assert!(!bus.is_connected());
        assert_eq!(publisher.link_state(), LinkState::Disconnected);
        assert!(!publisher.publish("k", vec![99]));
    }
}
