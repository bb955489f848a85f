// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lifecycle: connect, start and shutdown.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::SensorSyncConfig;
use crate::connectivity::TcpProbe;
use crate::publisher::{MessageBus, RedisBus};
use crate::storage::sql::SqlTierStore;
use crate::storage::traits::TierStore;

use super::{Components, EngineState, SensorSync, StartupError};

impl SensorSync {
    /// Open the configured backends and start the background tasks.
    ///
    /// Startup order:
    /// 1. Local SQLite tier (required; failure is fatal)
    /// 2. Remote MySQL tier, lazily (the device may boot offline)
    /// 3. Redis bus client (optional; the first connect happens in the worker)
    /// 4. Reconciler and publisher tasks
    #[tracing::instrument(skip(config), fields(has_remote, has_bus))]
    pub async fn connect(config: SensorSyncConfig) -> Result<Self, StartupError> {
        let startup_start = Instant::now();
        info!("Starting sensor-sync...");

        // ========== PHASE 1: Local tier (required) ==========
        let phase_start = Instant::now();
        let local = match SqlTierStore::connect(&config.local_url).await {
            Ok(store) => {
                crate::metrics::set_backend_healthy("local", true);
                crate::metrics::record_startup_phase("local_connect", phase_start.elapsed());
                info!(url = %config.local_url, "Local tier ready");
                Arc::new(store) as Arc<dyn TierStore>
            }
            Err(e) => {
                error!(url = %config.local_url, error = %e, "Local tier unavailable");
                crate::metrics::set_backend_healthy("local", false);
                return Err(StartupError::Local(e));
            }
        };

        // ========== PHASE 2: Remote tier (optional, lazy) ==========
        let remote = match config.remote_url.as_deref() {
            Some(url) => match SqlTierStore::connect_lazy(url) {
                Ok(store) => {
                    tracing::Span::current().record("has_remote", true);
                    Some(Arc::new(store) as Arc<dyn TierStore>)
                }
                Err(e) => {
                    warn!(error = %e, "Remote tier misconfigured; running local-only");
                    tracing::Span::current().record("has_remote", false);
                    None
                }
            },
            None => {
                info!("No remote URL configured; running local-only");
                tracing::Span::current().record("has_remote", false);
                None
            }
        };

        // ========== PHASE 3: Message bus (optional) ==========
        let bus = match config.bus_url.as_deref() {
            Some(url) => match RedisBus::new(url, config.remote_timeout()) {
                Ok(bus) => {
                    tracing::Span::current().record("has_bus", true);
                    Some(Box::new(bus) as Box<dyn MessageBus>)
                }
                Err(e) => {
                    warn!(error = %e, "Message bus misconfigured; publishing disabled");
                    tracing::Span::current().record("has_bus", false);
                    None
                }
            },
            None => {
                tracing::Span::current().record("has_bus", false);
                None
            }
        };

        let probe = Arc::new(TcpProbe::new(
            config.probe_primary.clone(),
            config.probe_fallback.clone(),
            config.probe_host_timeout(),
        ));

        let engine = Self::from_parts(
            config,
            Components {
                local,
                remote,
                probe,
                bus,
            },
        );

        // ========== PHASE 4: Background tasks ==========
        engine.start()?;
        crate::metrics::record_startup_total(startup_start.elapsed());
        Ok(engine)
    }

    /// Spawn the reconciler and the publisher drain worker.
    ///
    /// Must be called from within a tokio runtime.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) -> Result<(), StartupError> {
        let state = self.state();
        if state != EngineState::Created {
            return Err(StartupError::InvalidState(state));
        }

        *self.reconciler_task.lock() = Some(Arc::clone(&self.reconciler).spawn());

        let worker = self.pending_worker.lock().take();
        if let Some(worker) = worker {
            *self.publisher_task.lock() = Some(worker.spawn());
        }

        self.set_state(EngineState::Running);
        info!(
            tables = ?self.reconciler.tables(),
            publisher = self.publisher.is_some(),
            "Sensor-sync running"
        );
        Ok(())
    }

    /// Stop background work. The in-flight reconciliation cycle completes;
    /// queued messages are dropped and the bus connection closed.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }
        let shutdown_start = Instant::now();
        info!("Initiating sensor-sync shutdown...");
        self.set_state(EngineState::ShuttingDown);

        let reconciler = self.reconciler_task.lock().take();
        if let Some(handle) = reconciler {
            handle.stop().await;
        }

        let publisher = self.publisher_task.lock().take();
        if let Some(handle) = publisher {
            handle.stop().await;
        }
        // Never started: drop the idle worker so producers see a closed queue
        self.pending_worker.lock().take();

        self.set_state(EngineState::Stopped);
        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Sensor-sync shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use super::*;
    use crate::reading::SensorPayload;
    use crate::sensors::GasLevels;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let h = harness(true);
        h.engine.start().unwrap();
        assert_eq!(h.engine.state(), EngineState::Running);
        assert!(h.engine.health().healthy);

        assert!(matches!(
            h.engine.start(),
            Err(StartupError::InvalidState(EngineState::Running))
        ));

        h.engine.shutdown().await;
        assert_eq!(h.engine.state(), EngineState::Stopped);
        assert!(!h.bus.is_connected());

        // Idempotent
        h.engine.shutdown().await;
        assert_eq!(h.engine.state(), EngineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_engine_replicates_in_background() {
        let h = harness(false);
        h.engine.track::<GasLevels>().await.unwrap();
        h.engine.start().unwrap();

        let report = h
            .engine
            .ingest(4, GasLevels { co2_ppm: 415.0, tvoc_ppb: 12.0 }, true)
            .await
            .unwrap();
        assert!(!report.reading.synced);

        h.probe.set_online(true);
        h.engine.oracle().force_refresh();
        while !h.local.rows(GasLevels::TABLE).iter().all(|r| r.synced) {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        h.engine.shutdown().await;

        assert_eq!(h.remote.len(GasLevels::TABLE), 1);
    }

    #[tokio::test]
    async fn test_connect_fails_without_local_tier() {
        let config = SensorSyncConfig {
            local_url: "sqlite:///nonexistent-dir/definitely/missing.db".to_string(),
            ..SensorSyncConfig::default()
        };
        // Startup retries are bounded, so this returns an error rather than hanging
        let result = tokio::time::timeout(Duration::from_secs(60), SensorSync::connect(config)).await;
        assert!(matches!(result, Ok(Err(StartupError::Local(_)))));
    }
}
