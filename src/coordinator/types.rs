// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sensor-sync coordinator.

use std::sync::Arc;

use thiserror::Error;

use crate::connectivity::ReachabilityProbe;
use crate::governor::PermitStats;
use crate::publisher::{LinkState, MessageBus, PublisherStatsSnapshot};
use crate::reading::Reading;
use crate::reconciler::CycleReport;
use crate::storage::traits::{StorageError, TierStore};
use crate::store::RemoteOutcome;

/// Coordinator lifecycle state.
///
/// Use [`super::SensorSync::state()`] to check the current state or
/// [`super::SensorSync::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, background tasks not started
    Created,
    /// Reconciler and publisher running
    Running,
    /// Stopping background tasks
    ShuttingDown,
    /// Background tasks stopped
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StartupError {
    /// The device cannot operate without its local store
    #[error("Local tier unavailable: {0}")]
    Local(#[source] StorageError),
    #[error("Cannot start from state {0}")]
    InvalidState(EngineState),
}

/// Injected backends for [`super::SensorSync::from_parts`].
pub struct Components {
    pub local: Arc<dyn TierStore>,
    pub remote: Option<Arc<dyn TierStore>>,
    pub probe: Arc<dyn ReachabilityProbe>,
    pub bus: Option<Box<dyn MessageBus>>,
}

/// What one ingestion did.
#[derive(Debug, Clone)]
pub struct IngestReport<P> {
    /// The reading as stored (or as forwarded, if transient)
    pub reading: Reading<P>,
    /// `None` for transient readings, which are never stored
    pub remote: Option<RemoteOutcome>,
    /// Whether the publish queue accepted the message
    pub published: bool,
}

/// Point-in-time health snapshot. Collected without I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Last connectivity verdict, fresh or stale; `None` before the first probe
    pub online: Option<bool>,
    pub remote_configured: bool,
    pub permits: PermitStats,
    /// `None` when no bus is configured
    pub publisher_link: Option<LinkState>,
    pub publisher: Option<PublisherStatsSnapshot>,
    pub publish_queue_len: usize,
    pub tracked_tables: Vec<&'static str>,
    pub last_cycle: Option<CycleReport>,
    /// Running with a usable local tier
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Running), "Running");
        assert_eq!(format!("{}", EngineState::ShuttingDown), "ShuttingDown");
        assert_eq!(format!("{}", EngineState::Stopped), "Stopped");
    }

    #[test]
    fn test_startup_error_display() {
        let err = StartupError::InvalidState(EngineState::Stopped);
        assert_eq!(err.to_string(), "Cannot start from state Stopped");

        let err = StartupError::Local(StorageError::Backend("unable to open database file".into()));
        assert!(err.to_string().starts_with("Local tier unavailable"));
    }
}
