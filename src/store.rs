// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dual-tier store: local-first writes with opportunistic remote replication.
//!
//! # Write path
//!
//! ```text
//! save(reading, online)
//!   │
//!   ├─▶ Local insert (synced = false) ──error──▶ StoreError::Local
//!   │
//!   └─▶ online? ──no──▶ RemoteOutcome::Offline
//!         │
//!         └─▶ Remote upsert keyed by local id (bounded retry, backoff)
//!               ├─ ok ──▶ Local synced = true if unchanged ──▶ Confirmed
//!               │         (rewritten meanwhile: unsynced) ──▶ Superseded
//!               └─ err ─▶ row left unsynced ──────────────▶ Deferred / Rejected
//! ```
//!
//! A Remote write and its Local confirmation hold a per-row lock, so a stale
//! snapshot cannot land on Remote between a newer write and its confirmation.
//!
//! A successful return means the Local write is durable. Remote failures are
//! never surfaced as errors; they come back as a [`RemoteOutcome`] and the
//! reconciler replays the row later.
//!
//! # Read path
//!
//! Reads go to Remote when online, Local otherwise. The governor degrades a
//! failing Remote read to Local.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::governor::ConcurrencyGovernor;
use crate::reading::{Reading, SensorPayload};
use crate::resilience::retry::{retry_counted, RetryConfig, RetryFailure, Retryable};
use crate::storage::traits::{StorageError, StoredRow, Tier, TierStore};

/// Caller-facing error. Only Local failures and bad input reach the caller.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Reading not found")]
    NotFound,
    #[error("Local tier failure: {0}")]
    Local(#[source] StorageError),
}

impl StoreError {
    /// HTTP-equivalent status for the request layer.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::NotFound => 404,
            Self::Local(_) => 500,
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => Self::NotFound,
            StorageError::InvalidInput(msg) => Self::InvalidInput(msg),
            other => Self::Local(other),
        }
    }
}

/// What happened on the Remote tier for one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Remote has the row and Local is marked synced
    Confirmed,
    /// Remote not attempted (offline or no remote tier)
    Offline,
    /// Remote failed with a transient error; the reconciler will replay
    Deferred { attempts: usize, error: String },
    /// Remote refused the row outright
    Rejected { error: String },
    /// Remote took the write but Local was rewritten meanwhile; the
    /// reconciler replays the newer content
    Superseded,
}

impl RemoteOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Offline => "offline",
            Self::Deferred { .. } => "deferred",
            Self::Rejected { .. } => "rejected",
            Self::Superseded => "superseded",
        }
    }

    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed)
    }

    fn from_failure(failure: RetryFailure<StorageError>) -> Self {
        if failure.error.is_retryable() {
            Self::Deferred {
                attempts: failure.attempts,
                error: failure.error.to_string(),
            }
        } else {
            Self::Rejected {
                error: failure.error.to_string(),
            }
        }
    }
}

/// Result of `save`/`update`: the reading as stored locally, plus the Remote outcome.
#[derive(Debug, Clone)]
pub struct WriteReport<P> {
    pub reading: Reading<P>,
    pub remote: RemoteOutcome,
}

/// Result of `delete`. Remote deletes are not replayed by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub local_removed: u64,
    pub remote_removed: Option<u64>,
    pub remote: RemoteOutcome,
}

const ROW_LOCK_STRIPES: usize = 64;

pub struct DualTierStore {
    local: Arc<dyn TierStore>,
    remote: Option<Arc<dyn TierStore>>,
    governor: Arc<ConcurrencyGovernor>,
    remote_retry: RetryConfig,
    /// Serializes Remote write + Local confirm per row (striped by table and id)
    row_locks: Vec<Mutex<()>>,
}

impl DualTierStore {
    pub fn new(
        local: Arc<dyn TierStore>,
        remote: Option<Arc<dyn TierStore>>,
        governor: Arc<ConcurrencyGovernor>,
        remote_retry: RetryConfig,
    ) -> Self {
        Self {
            local,
            remote,
            governor,
            remote_retry,
            row_locks: (0..ROW_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    #[must_use]
    pub fn governor(&self) -> &Arc<ConcurrencyGovernor> {
        &self.governor
    }

    /// The remote tier, if configured and the caller believes it reachable.
    fn remote_if(&self, online: bool) -> Option<&Arc<dyn TierStore>> {
        self.remote.as_ref().filter(|_| online)
    }

    fn tier(&self, tier: Tier) -> Arc<dyn TierStore> {
        match (tier, &self.remote) {
            (Tier::Remote, Some(remote)) => Arc::clone(remote),
            _ => Arc::clone(&self.local),
        }
    }

    fn preferred(&self, online: bool) -> Tier {
        if self.remote_if(online).is_some() {
            Tier::Remote
        } else {
            Tier::Local
        }
    }

    fn validate_project(project_id: i64) -> Result<(), StoreError> {
        if project_id <= 0 {
            return Err(StoreError::InvalidInput(format!(
                "project_id must be positive, got {}",
                project_id
            )));
        }
        Ok(())
    }

    /// Create `table` on Local (and on Remote when reachable).
    pub async fn ensure_table(&self, table: &str, online: bool) -> Result<(), StoreError> {
        self.governor
            .guarded(Tier::Local, "ensure_table", self.local.ensure_table(table))
            .await?;
        if let Some(remote) = self.remote_if(online) {
            if let Err(e) = self
                .governor
                .guarded(Tier::Remote, "ensure_table", remote.ensure_table(table))
                .await
            {
                warn!(table, error = %e, "Remote table setup failed; will retry on first write");
            }
        }
        Ok(())
    }

    /// Persist a new reading locally, then replicate it if online.
    pub async fn save<P: SensorPayload>(
        &self,
        reading: Reading<P>,
        online: bool,
    ) -> Result<WriteReport<P>, StoreError> {
        Self::validate_project(reading.project_id)?;
        if reading.id.is_some() {
            return Err(StoreError::InvalidInput(
                "reading already has an id; use update".to_string(),
            ));
        }

        let table = P::TABLE;
        let mut reading = reading;
        reading.synced = false;
        let mut row = reading.to_row().map_err(|e| StoreError::InvalidInput(e.to_string()))?;

        let id = self
            .governor
            .guarded(Tier::Local, "insert", self.local.insert(table, &row))
            .await
            .map_err(|e| {
                error!(table, project_id = reading.project_id, error = %e, "Local insert failed");
                StoreError::Local(e)
            })?;
        crate::metrics::record_items_written(Tier::Local.as_str(), 1);
        reading.id = Some(id);
        row.id = Some(id);
        debug!(table, id, project_id = reading.project_id, "Reading stored locally");

        let remote = self.replicate(table, row, online, "save").await;
        reading.synced = remote.is_confirmed();
        Ok(WriteReport { reading, remote })
    }

    /// Overwrite an existing reading by id, locally then remotely.
    pub async fn update<P: SensorPayload>(
        &self,
        reading: Reading<P>,
        online: bool,
    ) -> Result<WriteReport<P>, StoreError> {
        let Some(id) = reading.id else {
            return Err(StoreError::InvalidInput("update requires an id".to_string()));
        };
        Self::validate_project(reading.project_id)?;

        let table = P::TABLE;
        let mut reading = reading;
        reading.synced = false;
        let row = reading.to_row().map_err(|e| StoreError::InvalidInput(e.to_string()))?;

        let found = self
            .governor
            .guarded(Tier::Local, "update", self.local.update(table, &row))
            .await
            .map_err(|e| {
                error!(table, id, error = %e, "Local update failed");
                StoreError::Local(e)
            })?;
        if !found {
            return Err(StoreError::NotFound);
        }
        crate::metrics::record_items_written(Tier::Local.as_str(), 1);

        let remote = self.replicate(table, row, online, "update").await;
        reading.synced = remote.is_confirmed();
        Ok(WriteReport { reading, remote })
    }

    /// Write one locally-stored row to Remote with retries, then confirm it locally.
    async fn replicate(&self, table: &str, mut row: StoredRow, online: bool, operation: &str) -> RemoteOutcome {
        let Some(remote) = self.remote_if(online) else {
            crate::metrics::record_remote_outcome(operation, "offline");
            return RemoteOutcome::Offline;
        };
        row.synced = true;

        let result = retry_counted("remote_write", &self.remote_retry, || {
            self.write_through(remote, table, &row)
        })
        .await;

        let outcome = match result {
            Ok(true) => RemoteOutcome::Confirmed,
            Ok(false) => {
                debug!(table, id = ?row.id, "Local row rewritten during remote write; left for the reconciler");
                RemoteOutcome::Superseded
            }
            Err(failure) => {
                warn!(
                    table,
                    id = ?row.id,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Remote write failed; row left unsynced for the reconciler"
                );
                RemoteOutcome::from_failure(failure)
            }
        };
        crate::metrics::record_remote_outcome(operation, outcome.as_str());
        outcome
    }

    fn row_lock(&self, table: &str, id: i64) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        (table, id).hash(&mut hasher);
        &self.row_locks[(hasher.finish() as usize) % self.row_locks.len()]
    }

    /// One Remote upsert of `row`, then its Local confirmation, under the
    /// row's lock. `Ok(false)` means Local no longer holds `row`'s content
    /// and has been flagged unsynced.
    async fn write_through(
        &self,
        remote: &Arc<dyn TierStore>,
        table: &str,
        row: &StoredRow,
    ) -> Result<bool, StorageError> {
        let id = row.require_id()?;
        let limit = self.governor.timeout_for(Tier::Remote);
        let _row_guard = timeout(limit, self.row_lock(table, id).lock())
            .await
            .map_err(|_| StorageError::Timeout { tier: Tier::Remote, after: limit })?;

        self.governor
            .guarded(Tier::Remote, "upsert", remote.upsert(table, row))
            .await?;
        crate::metrics::record_items_written(Tier::Remote.as_str(), 1);

        self.governor
            .guarded(Tier::Local, "confirm_synced", self.local.confirm_synced(table, row))
            .await
            .inspect_err(|e| warn!(table, id, error = %e, "Could not mark row synced locally"))
    }

    /// Delete every reading of a project. The two tiers are independent.
    pub async fn delete<P: SensorPayload>(
        &self,
        project_id: i64,
        online: bool,
    ) -> Result<DeleteReport, StoreError> {
        Self::validate_project(project_id)?;
        let table = P::TABLE;

        let local = self
            .governor
            .guarded(Tier::Local, "delete", self.local.delete_by_project(table, project_id))
            .await;

        let (remote, remote_removed) = match self.remote_if(online) {
            None => (RemoteOutcome::Offline, None),
            Some(remote) => match self
                .governor
                .guarded(Tier::Remote, "delete", remote.delete_by_project(table, project_id))
                .await
            {
                Ok(removed) => (RemoteOutcome::Confirmed, Some(removed)),
                Err(e) => {
                    warn!(table, project_id, error = %e, "Remote delete failed");
                    let failure = RetryFailure { attempts: 1, error: e };
                    (RemoteOutcome::from_failure(failure), None)
                }
            },
        };
        crate::metrics::record_remote_outcome("delete", remote.as_str());

        let local_removed = local.map_err(|e| {
            error!(table, project_id, error = %e, "Local delete failed");
            StoreError::Local(e)
        })?;
        debug!(table, project_id, local_removed, ?remote_removed, "Project readings deleted");

        Ok(DeleteReport {
            local_removed,
            remote_removed,
            remote,
        })
    }

    pub async fn exists_by_project<P: SensorPayload>(
        &self,
        project_id: i64,
        online: bool,
    ) -> Result<bool, StoreError> {
        Self::validate_project(project_id)?;
        let table = P::TABLE;
        self.governor
            .read(self.preferred(online), "exists", |tier| {
                let store = self.tier(tier);
                async move { store.exists_by_project(table, project_id).await }
            })
            .await
            .map_err(StoreError::Local)
    }

    /// Readings of a project ordered by timestamp.
    pub async fn get_by_project_id<P: SensorPayload>(
        &self,
        project_id: i64,
        online: bool,
    ) -> Result<Vec<Reading<P>>, StoreError> {
        Self::validate_project(project_id)?;
        let table = P::TABLE;
        let rows = self
            .governor
            .read(self.preferred(online), "get_by_project", |tier| {
                let store = self.tier(tier);
                async move { store.get_by_project(table, project_id).await }
            })
            .await
            .map_err(StoreError::Local)?;

        rows.into_iter()
            .map(|row| Reading::from_row(row).map_err(StoreError::Local))
            .collect()
    }

    pub async fn get_by_id<P: SensorPayload>(&self, id: i64, online: bool) -> Result<Reading<P>, StoreError> {
        if id <= 0 {
            return Err(StoreError::InvalidInput(format!("id must be positive, got {}", id)));
        }
        let table = P::TABLE;
        let row = self
            .governor
            .read(self.preferred(online), "get_by_id", |tier| {
                let store = self.tier(tier);
                async move { store.get_by_id(table, id).await }
            })
            .await
            .map_err(StoreError::Local)?
            .ok_or(StoreError::NotFound)?;

        Reading::from_row(row).map_err(StoreError::Local)
    }

    /// One page of Local rows awaiting replication.
    pub(crate) async fn scan_unsynced(
        &self,
        table: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StorageError> {
        self.governor
            .guarded(Tier::Local, "scan", self.local.scan_unsynced(table, after_id, limit))
            .await
    }

    /// Single-attempt replay used by the reconciler: Remote upsert, then
    /// Local confirmation. `Ok(false)` if `row` is a stale snapshot; the
    /// newer content stays unsynced for a later cycle.
    pub(crate) async fn replay(&self, table: &str, row: &StoredRow) -> Result<bool, StorageError> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| StorageError::Backend("no remote tier configured".to_string()))?;

        let mut remote_row = row.clone();
        remote_row.synced = true;
        self.write_through(remote, table, &remote_row).await
    }
}
