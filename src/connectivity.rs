// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connectivity oracle: a cached, single-flight reachability verdict.
//!
//! Callers ask [`ConnectivityOracle::is_online`] before touching the remote
//! tier. The verdict is cached for a TTL; on a cache miss exactly one probe
//! runs and every caller waiting on it gets the same answer.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sensor_sync::connectivity::{ConnectivityOracle, StaticProbe};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let oracle = ConnectivityOracle::new(
//!     Arc::new(StaticProbe::new(true)),
//!     Duration::from_secs(15),
//!     Duration::from_secs(3),
//! );
//! assert!(oracle.is_online().await);
//! assert_eq!(oracle.probe_count(), 1);
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// A low-level reachability check. `false` means offline; never errors.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// TCP connect to a primary `host:port`, then a fallback if the primary fails.
pub struct TcpProbe {
    primary: String,
    fallback: Option<String>,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(primary: impl Into<String>, fallback: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            primary: primary.into(),
            fallback,
            connect_timeout,
        }
    }

    async fn reach(&self, target: &str) -> bool {
        match timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(target, error = %e, "Probe connect failed");
                false
            }
            Err(_) => {
                debug!(target, timeout = ?self.connect_timeout, "Probe connect timed out");
                false
            }
        }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self) -> bool {
        if self.reach(&self.primary).await {
            return true;
        }
        match &self.fallback {
            Some(fallback) => self.reach(fallback).await,
            None => false,
        }
    }
}

/// Fixed-answer probe, switchable at runtime.
pub struct StaticProbe {
    online: AtomicBool,
}

impl StaticProbe {
    #[must_use]
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn probe(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// A point-in-time reachability verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub online: bool,
    pub probed_at: Instant,
}

/// Process-lifetime connectivity cache. Construct once at startup and share.
pub struct ConnectivityOracle {
    probe: Arc<dyn ReachabilityProbe>,
    ttl: Duration,
    probe_timeout: Duration,
    verdict: RwLock<Option<Verdict>>,
    /// Held for the duration of a probe (single-flight)
    in_flight: Mutex<()>,
    probes: AtomicU64,
}

impl ConnectivityOracle {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, ttl: Duration, probe_timeout: Duration) -> Self {
        Self {
            probe,
            ttl,
            probe_timeout,
            verdict: RwLock::new(None),
            in_flight: Mutex::new(()),
            probes: AtomicU64::new(0),
        }
    }

    /// Build from config with a [`TcpProbe`].
    pub fn from_config(config: &crate::config::SensorSyncConfig) -> Self {
        let probe = TcpProbe::new(
            config.probe_primary.clone(),
            config.probe_fallback.clone(),
            config.probe_host_timeout(),
        );
        Self::new(Arc::new(probe), config.connectivity_ttl(), config.probe_timeout())
    }

    fn fresh_verdict(&self) -> Option<bool> {
        let verdict = (*self.verdict.read())?;
        (verdict.probed_at.elapsed() < self.ttl).then_some(verdict.online)
    }

    /// Whether the device is online, from cache or a fresh probe.
    pub async fn is_online(&self) -> bool {
        if let Some(online) = self.fresh_verdict() {
            return online;
        }

        let _flight = self.in_flight.lock().await;

        // Another caller may have probed while we waited
        if let Some(online) = self.fresh_verdict() {
            return online;
        }

        self.probes.fetch_add(1, Ordering::Relaxed);
        let online = match timeout(self.probe_timeout, self.probe.probe()).await {
            Ok(online) => online,
            Err(_) => {
                warn!(timeout = ?self.probe_timeout, "Connectivity probe timed out, assuming offline");
                false
            }
        };

        let previous = self.verdict.write().replace(Verdict {
            online,
            probed_at: Instant::now(),
        });
        if previous.map(|v| v.online) != Some(online) {
            info!(online, "Connectivity changed");
        }
        crate::metrics::record_connectivity_probe(online);

        online
    }

    /// Invalidate the cached verdict; the next call probes.
    pub fn force_refresh(&self) {
        *self.verdict.write() = None;
        debug!("Connectivity cache invalidated");
    }

    /// Last verdict, fresh or stale.
    #[must_use]
    pub fn last_verdict(&self) -> Option<Verdict> {
        *self.verdict.read()
    }

    /// Number of probes executed since construction.
    #[must_use]
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}
