// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message bus drivers.
//!
//! The drain worker is the only caller, so methods take `&mut self` and
//! drivers keep their connection state without interior locking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError};
use thiserror::Error;
use tokio::time::timeout;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The link is unusable; the worker must reconnect
    #[error("Bus connection error: {0}")]
    Connection(String),
    /// This message failed; the link is still usable
    #[error("Bus publish error: {0}")]
    Publish(String),
}

#[async_trait]
pub trait MessageBus: Send {
    async fn connect(&mut self) -> Result<(), BusError>;

    /// Fire-and-forget delivery of one message to `topic`.
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BusError>;

    async fn close(&mut self);
}

/// Redis pub/sub. `PUBLISH` keeps nothing for absent subscribers, which is
/// the non-persistent delivery this queue wants.
pub struct RedisBus {
    client: Client,
    connection: Option<MultiplexedConnection>,
    response_timeout: Duration,
}

impl RedisBus {
    pub fn new(url: &str, response_timeout: Duration) -> Result<Self, BusError> {
        let client = Client::open(url).map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            connection: None,
            response_timeout,
        })
    }

    fn classify(err: RedisError) -> BusError {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            BusError::Connection(err.to_string())
        } else {
            BusError::Publish(err.to_string())
        }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn connect(&mut self) -> Result<(), BusError> {
        let connection = timeout(
            self.response_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| BusError::Connection("connect timed out".to_string()))?
        .map_err(Self::classify)?;
        self.connection = Some(connection);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| BusError::Connection("not connected".to_string()))?;

        let result: Result<Result<i64, RedisError>, _> =
            timeout(self.response_timeout, connection.publish(topic, payload)).await;

        let outcome = match result {
            Ok(Ok(_receivers)) => Ok(()),
            Ok(Err(e)) => Err(Self::classify(e)),
            Err(_) => Err(BusError::Connection("publish timed out".to_string())),
        };
        if matches!(outcome, Err(BusError::Connection(_))) {
            self.connection = None;
        }
        outcome
    }

    async fn close(&mut self) {
        self.connection = None;
    }
}

#[derive(Default)]
struct MemoryBusState {
    reachable: bool,
    connected: bool,
    connect_attempts: usize,
    published: Vec<(String, Vec<u8>)>,
}

/// In-process bus that records what it is given. Clones share state, so a
/// test can keep one handle while the worker owns another.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<MemoryBusState>>,
}

impl MemoryBus {
    #[must_use]
    pub fn new(reachable: bool) -> Self {
        let bus = Self::default();
        bus.state.lock().reachable = reachable;
        bus
    }

    /// Take the broker up or down. Going down severs the current link.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock();
        state.reachable = reachable;
        if !reachable {
            state.connected = false;
        }
    }

    #[must_use]
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().published.clone()
    }

    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn connect(&mut self) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.reachable {
            state.connected = true;
            Ok(())
        } else {
            Err(BusError::Connection("broker unreachable".to_string()))
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BusError::Connection("link severed".to_string()));
        }
        state.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_bus_records_when_connected() {
        let handle = MemoryBus::new(true);
        let mut bus = handle.clone();

        assert!(matches!(bus.publish("t", b"x").await, Err(BusError::Connection(_))));
        bus.connect().await.unwrap();
        bus.publish("sensors.gas_readings", b"{}").await.unwrap();

        assert_eq!(handle.published(), vec![("sensors.gas_readings".to_string(), b"{}".to_vec())]);
        assert_eq!(handle.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_memory_bus_outage_severs_link() {
        let handle = MemoryBus::new(true);
        let mut bus = handle.clone();
        bus.connect().await.unwrap();

        handle.set_reachable(false);
        assert!(!handle.is_connected());
        assert!(matches!(bus.publish("t", b"x").await, Err(BusError::Connection(_))));
        assert!(bus.connect().await.is_err());

        handle.set_reachable(true);
        bus.connect().await.unwrap();
        bus.close().await;
        assert!(!handle.is_connected());
    }

    #[test]
    fn test_redis_bus_rejects_bad_url() {
        assert!(matches!(
            RedisBus::new("not a url", Duration::from_secs(1)),
            Err(BusError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_redis_bus_publish_before_connect() {
        let mut bus = RedisBus::new("redis://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        assert!(matches!(bus.publish("t", b"x").await, Err(BusError::Connection(_))));
    }
}
