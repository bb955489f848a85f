// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sensor-sync coordinator.
//!
//! [`SensorSync`] owns the long-lived pieces and wires them together:
//! - the connectivity oracle
//! - the dual-tier store (behind the concurrency governor)
//! - the sync reconciler task
//! - the publisher and its drain worker task
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use sensor_sync::{SensorSync, SensorSyncConfig};
//! use sensor_sync::sensors::Environment;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SensorSync::connect(SensorSyncConfig::default()).await?;
//! engine.track::<Environment>().await?;
//!
//! let reading = Environment { temperature_c: 21.4, humidity_pct: 40.0, pressure_hpa: None };
//! let report = engine.ingest(12, reading, true).await?;
//! println!("stored as {:?}, remote {:?}", report.reading.id, report.remote);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{Components, EngineState, HealthCheck, IngestReport, StartupError};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::SensorSyncConfig;
use crate::connectivity::ConnectivityOracle;
use crate::governor::ConcurrencyGovernor;
use crate::publisher::{DrainWorker, Publisher, PublisherHandle};
use crate::reconciler::{ReconcilerHandle, SyncReconciler};
use crate::store::DualTierStore;

/// Main coordinator. `Send + Sync`; share it behind an `Arc`.
pub struct SensorSync {
    pub(super) config: SensorSyncConfig,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) oracle: Arc<ConnectivityOracle>,
    pub(super) store: Arc<DualTierStore>,
    pub(super) reconciler: Arc<SyncReconciler>,

    /// `None` when no bus is configured
    pub(super) publisher: Option<Publisher>,

    /// Drain worker waiting for `start()`
    pub(super) pending_worker: Mutex<Option<DrainWorker>>,
    pub(super) publisher_task: Mutex<Option<PublisherHandle>>,
    pub(super) reconciler_task: Mutex<Option<ReconcilerHandle>>,
}

impl SensorSync {
    /// Wire injected backends together. Nothing runs until [`Self::start`].
    pub fn from_parts(config: SensorSyncConfig, parts: Components) -> Self {
        let governor = Arc::new(ConcurrencyGovernor::from_config(&config));
        let oracle = Arc::new(ConnectivityOracle::new(
            parts.probe,
            config.connectivity_ttl(),
            config.probe_timeout(),
        ));
        let store = Arc::new(DualTierStore::new(
            parts.local,
            parts.remote,
            governor,
            config.remote_write_retry(),
        ));
        let reconciler = Arc::new(SyncReconciler::new(
            Arc::clone(&store),
            Arc::clone(&oracle),
            config.reconcile_interval(),
            config.reconcile_page_size,
        ));

        let (publisher, worker) = match parts.bus {
            Some(bus) => {
                let (publisher, worker) = Publisher::channel(
                    bus,
                    &config.bus_exchange,
                    config.publish_queue_capacity,
                    config.reconnect_interval(),
                );
                (Some(publisher), Some(worker))
            }
            None => (None, None),
        };

        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        Self {
            config,
            state: state_tx,
            state_rx,
            oracle,
            store,
            reconciler,
            publisher,
            pending_worker: Mutex::new(worker),
            publisher_task: Mutex::new(None),
            reconciler_task: Mutex::new(None),
        }
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    #[must_use]
    pub fn config(&self) -> &SensorSyncConfig {
        &self.config
    }

    #[must_use]
    pub fn oracle(&self) -> &Arc<ConnectivityOracle> {
        &self.oracle
    }

    #[must_use]
    pub fn store(&self) -> &Arc<DualTierStore> {
        &self.store
    }

    #[must_use]
    pub fn reconciler(&self) -> &Arc<SyncReconciler> {
        &self.reconciler
    }

    #[must_use]
    pub fn publisher(&self) -> Option<&Publisher> {
        self.publisher.as_ref()
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    /// Collect a health snapshot (no I/O).
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let state = self.state();
        HealthCheck {
            state,
            online: self.oracle.last_verdict().map(|v| v.online),
            remote_configured: self.store.has_remote(),
            permits: self.store.governor().permits(),
            publisher_link: self.publisher.as_ref().map(Publisher::link_state),
            publisher: self.publisher.as_ref().map(Publisher::stats),
            publish_queue_len: self.publisher.as_ref().map_or(0, Publisher::queue_len),
            tracked_tables: self.reconciler.tables(),
            last_cycle: self.reconciler.last_report(),
            healthy: state == EngineState::Running,
        }
    }
}
