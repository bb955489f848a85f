// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Concurrency governor: per-tier permits and timeouts around storage calls.
//!
//! Failure policy for reads is asymmetric:
//!
//! ```text
//! Remote ──timeout/error──▶ Local ──error──▶ caller
//! ```
//!
//! Remote degrades to Local, Local degrades to an error. Never the reverse.
//! Permits come from `tokio::sync::Semaphore`, which is FIFO-fair, and are
//! released by drop on every exit path. A timed-out remote call is abandoned,
//! not cancelled server-side.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::config::SensorSyncConfig;
use crate::storage::traits::{StorageError, Tier};

/// Snapshot of free permits per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitStats {
    pub local_available: usize,
    pub remote_available: usize,
}

pub struct ConcurrencyGovernor {
    local_permits: Arc<Semaphore>,
    remote_permits: Arc<Semaphore>,
    local_timeout: Duration,
    remote_timeout: Duration,
}

impl ConcurrencyGovernor {
    pub fn new(
        local_permits: usize,
        remote_permits: usize,
        local_timeout: Duration,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            local_permits: Arc::new(Semaphore::new(local_permits.max(1))),
            remote_permits: Arc::new(Semaphore::new(remote_permits.max(1))),
            local_timeout,
            remote_timeout,
        }
    }

    pub fn from_config(config: &SensorSyncConfig) -> Self {
        Self::new(
            config.local_permits,
            config.remote_permits,
            config.local_timeout(),
            config.remote_timeout(),
        )
    }

    fn pool(&self, tier: Tier) -> &Semaphore {
        match tier {
            Tier::Local => &self.local_permits,
            Tier::Remote => &self.remote_permits,
        }
    }

    #[must_use]
    pub fn timeout_for(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Local => self.local_timeout,
            Tier::Remote => self.remote_timeout,
        }
    }

    #[must_use]
    pub fn permits(&self) -> PermitStats {
        PermitStats {
            local_available: self.local_permits.available_permits(),
            remote_available: self.remote_permits.available_permits(),
        }
    }

    /// Run one call against `tier` under a permit and the tier's timeout.
    ///
    /// On Remote the timeout also covers the wait for a permit, so a hung
    /// remote with a saturated pool still fails within one timeout. Local
    /// callers queue for a permit and the timeout starts once they hold one.
    pub async fn guarded<T, Fut>(&self, tier: Tier, operation: &str, call: Fut) -> Result<T, StorageError>
    where
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let limit = self.timeout_for(tier);
        let wait_start = Instant::now();
        let acquire = self.pool(tier).acquire();
        let permit = match tier {
            Tier::Local => acquire.await,
            Tier::Remote => match timeout_at(wait_start + limit, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    crate::metrics::record_timeout(tier.as_str(), operation);
                    crate::metrics::record_operation(tier.as_str(), operation, "error");
                    return Err(StorageError::Timeout { tier, after: limit });
                }
            },
        };
        let _permit = permit.map_err(|_| StorageError::Backend(format!("{} permit pool closed", tier)))?;
        crate::metrics::record_permit_wait(tier.as_str(), wait_start.elapsed());

        let deadline = match tier {
            Tier::Local => Instant::now() + limit,
            Tier::Remote => wait_start + limit,
        };
        let start = Instant::now();
        let result = match timeout_at(deadline, call).await {
            Ok(result) => result,
            Err(_) => {
                crate::metrics::record_timeout(tier.as_str(), operation);
                Err(StorageError::Timeout { tier, after: limit })
            }
        };
        crate::metrics::record_latency(tier.as_str(), operation, start.elapsed());
        crate::metrics::record_operation(
            tier.as_str(),
            operation,
            if result.is_ok() { "success" } else { "error" },
        );
        result
    }

    /// Run a read on `preferred`, falling back to Local if Remote fails.
    ///
    /// `call` builds the same logical operation for whichever tier it is given.
    /// A Local failure (first choice or fallback) is returned to the caller.
    pub async fn read<T, F, Fut>(&self, preferred: Tier, operation: &str, call: F) -> Result<T, StorageError>
    where
        F: Fn(Tier) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        if preferred == Tier::Remote {
            match self.guarded(Tier::Remote, operation, call(Tier::Remote)).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(operation, error = %e, "Remote read failed, falling back to local tier");
                    crate::metrics::record_fallback(operation);
                }
            }
        }

        self.guarded(Tier::Local, operation, call(Tier::Local))
            .await
            .inspect_err(|e| {
                debug!(operation, error = %e, "Local read failed");
            })
    }
}
