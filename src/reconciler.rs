// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync reconciler: replays unsynced Local rows to Remote.
//!
//! Each cycle walks every tracked table by ascending id, one page at a
//! time, and gives each unsynced row a single Remote attempt. Failures stay
//! unsynced for the next cycle; there is no backoff across cycles.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityOracle;
use crate::reading::SensorPayload;
use crate::store::DualTierStore;

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub online: bool,
    pub scanned: usize,
    pub synced: usize,
    pub failed: usize,
}

pub struct SyncReconciler {
    store: Arc<DualTierStore>,
    oracle: Arc<ConnectivityOracle>,
    tables: RwLock<BTreeSet<&'static str>>,
    interval: Duration,
    page_size: usize,
    last_report: RwLock<Option<CycleReport>>,
}

impl SyncReconciler {
    pub fn new(
        store: Arc<DualTierStore>,
        oracle: Arc<ConnectivityOracle>,
        interval: Duration,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            oracle,
            tables: RwLock::new(BTreeSet::new()),
            interval,
            page_size: page_size.max(1),
            last_report: RwLock::new(None),
        }
    }

    /// Include `P`'s table in every subsequent cycle.
    pub fn track<P: SensorPayload>(&self) {
        self.track_table(P::TABLE);
    }

    pub fn track_table(&self, table: &'static str) {
        if self.tables.write().insert(table) {
            debug!(table, "Reconciler tracking table");
        }
    }

    #[must_use]
    pub fn tables(&self) -> Vec<&'static str> {
        self.tables.read().iter().copied().collect()
    }

    #[must_use]
    pub fn last_report(&self) -> Option<CycleReport> {
        *self.last_report.read()
    }

    /// Run one cycle now.
    #[tracing::instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleReport {
        let online = self.oracle.is_online().await && self.store.has_remote();
        if !online {
            debug!("Offline; reconciliation skipped");
            crate::metrics::record_reconcile_skipped();
            let report = CycleReport::default();
            *self.last_report.write() = Some(report);
            return report;
        }

        let start = Instant::now();
        let mut report = CycleReport {
            online: true,
            ..CycleReport::default()
        };
        for table in self.tables() {
            self.reconcile_table(table, &mut report).await;
        }

        crate::metrics::record_reconcile_cycle(report.scanned, report.synced, report.failed, start.elapsed());
        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                synced = report.synced,
                failed = report.failed,
                "Reconciliation cycle complete"
            );
        }
        *self.last_report.write() = Some(report);
        report
    }

    async fn reconcile_table(&self, table: &'static str, report: &mut CycleReport) {
        let mut cursor = 0;
        loop {
            let page = match self.store.scan_unsynced(table, cursor, self.page_size).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(table, error = %e, "Unsynced scan failed; table skipped this cycle");
                    return;
                }
            };
            let Some(last) = page.last().and_then(|row| row.id) else {
                return;
            };
            let full_page = page.len() >= self.page_size;

            for row in &page {
                report.scanned += 1;
                match self.store.replay(table, row).await {
                    Ok(true) => {
                        report.synced += 1;
                        debug!(table, id = ?row.id, "Row replayed to remote");
                    }
                    Ok(false) => {
                        report.failed += 1;
                        debug!(table, id = ?row.id, "Row rewritten during replay; newer content goes next cycle");
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(table, id = ?row.id, error = %e, "Replay failed; retrying next cycle");
                    }
                }
            }

            if !full_page {
                return;
            }
            cursor = last;
        }
    }

    /// Cycle every `interval` until `stop` flips. An in-flight cycle finishes.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!(interval = ?self.interval, tables = ?self.tables(), "Reconciler started");
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

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
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
        info!("Reconciler stopped");
    }

    /// Run on a tokio task and return a handle that can stop it.
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        ReconcilerHandle { stop_tx, task }
    }
}

/// Stops a spawned reconciler.
pub struct ReconcilerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Signal stop and wait for the in-flight cycle (if any) to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Reconciler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::StaticProbe;
    use crate::governor::ConcurrencyGovernor;
    use crate::reading::Reading;
    use crate::resilience::retry::RetryConfig;
    use crate::storage::memory::MemoryTierStore;
    use crate::storage::traits::TierStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Lux {
        lux: u32,
    }

    impl SensorPayload for Lux {
        const TABLE: &'static str = "lux_readings";
    }

    struct Fixture {
        reconciler: Arc<SyncReconciler>,
        store: Arc<DualTierStore>,
        probe: Arc<StaticProbe>,
        oracle: Arc<ConnectivityOracle>,
        local: Arc<MemoryTierStore>,
        remote: Arc<MemoryTierStore>,
    }

    fn fixture(page_size: usize) -> Fixture {
        let local = Arc::new(MemoryTierStore::new());
        let remote = Arc::new(MemoryTierStore::new());
        let governor = Arc::new(ConcurrencyGovernor::new(
            4,
            2,
            Duration::from_secs(5),
            Duration::from_secs(3),
        ));
        let store = Arc::new(DualTierStore::new(
            local.clone(),
            Some(remote.clone() as Arc<dyn TierStore>),
            governor,
            RetryConfig::test(),
        ));
        let probe = Arc::new(StaticProbe::new(false));
        let oracle = Arc::new(ConnectivityOracle::new(
            probe.clone(),
            Duration::from_secs(15),
            Duration::from_secs(3),
        ));
        let reconciler = Arc::new(SyncReconciler::new(
            store.clone(),
            oracle.clone(),
            Duration::from_secs(10),
            page_size,
        ));
        reconciler.track::<Lux>();
        Fixture {
            reconciler,
            store,
            probe,
            oracle,
            local,
            remote,
        }
    }

    async fn save_offline(store: &DualTierStore, n: u32) {
        for lux in 0..n {
            store
                .save(Reading::new(1, Lux { lux }), false)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_offline_cycle_is_noop() {
        let fx = fixture(10);
        save_offline(&fx.store, 3).await;

        let report = fx.reconciler.run_cycle().await;
        assert_eq!(report, CycleReport::default());
        assert!(fx.remote.is_empty(Lux::TABLE));
        assert_eq!(fx.reconciler.last_report(), Some(report));
    }

    #[tokio::test]
    async fn test_online_cycle_replays_every_page() {
        let fx = fixture(2);
        save_offline(&fx.store, 5).await;
        fx.probe.set_online(true);
        fx.oracle.force_refresh();

        let report = fx.reconciler.run_cycle().await;
        assert_eq!(
            report,
            CycleReport {
                online: true,
                scanned: 5,
                synced: 5,
                failed: 0
            }
        );
        assert_eq!(fx.remote.len(Lux::TABLE), 5);
        assert!(fx.local.rows(Lux::TABLE).iter().all(|r| r.synced));

        // Nothing left on the next pass
        let report = fx.reconciler.run_cycle().await;
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn test_untracked_tables_are_ignored() {
        let fx = fixture(10);
        fx.probe.set_online(true);
        let row = crate::storage::traits::StoredRow {
            id: None,
            project_id: 1,
            payload: serde_json::json!({}),
            event: true,
            synced: false,
            timestamp: 0,
        };
        fx.local.insert("other_readings", &row).await.unwrap();

        let report = fx.reconciler.run_cycle().await;
        assert_eq!(report.scanned, 0);
        assert_eq!(fx.reconciler.tables(), vec!["lux_readings"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_syncs_and_stops() {
        let fx = fixture(10);
        save_offline(&fx.store, 2).await;
        fx.probe.set_online(true);

        let handle = fx.reconciler.clone().spawn();
        while !fx.local.rows(Lux::TABLE).iter().all(|r| r.synced) {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        handle.stop().await;

        assert_eq!(fx.remote.len(Lux::TABLE), 2);
        assert!(fx.reconciler.last_report().is_some());
    }
}
