// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reading data structure.
//!
//! A [`Reading`] is the unit that flows through the dual-tier store: fixed
//! bookkeeping columns plus a sensor-specific payload `P`.
//!
//! # Example
//!
//! ```
//! use sensor_sync::{Reading, SensorPayload};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Vibration {
//!     rms_g: f64,
//! }
//!
//! impl SensorPayload for Vibration {
//!     const TABLE: &'static str = "vibration_readings";
//! }
//!
//! let reading = Reading::new(7, Vibration { rms_g: 0.42 });
//! assert_eq!(reading.project_id, 7);
//! assert!(reading.id.is_none());
//! assert!(!reading.synced);
//! assert!(reading.event);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::storage::traits::{StorageError, StoredRow};

/// Sensor-specific payload fields. One table per payload type.
pub trait SensorPayload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table (and message routing key) for this sensor type. `[a-z0-9_]` only.
    const TABLE: &'static str;
}

/// Current time in epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading<P> {
    /// Assigned by the local tier on first write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub project_id: i64,
    /// Persist this reading (true) or only forward it (false)
    pub event: bool,
    /// Creation time (epoch millis)
    pub timestamp: i64,
    /// True once confirmed durable on the remote tier
    #[serde(default)]
    pub synced: bool,
    #[serde(flatten)]
    pub payload: P,
}

impl<P: SensorPayload> Reading<P> {
    /// A persisted (`event = true`) reading stamped with the current time.
    pub fn new(project_id: i64, payload: P) -> Self {
        Self {
            id: None,
            project_id,
            event: true,
            timestamp: now_millis(),
            synced: false,
            payload,
        }
    }

    /// A transient reading: forwarded to the bus, never stored.
    pub fn transient(project_id: i64, payload: P) -> Self {
        Self {
            event: false,
            ..Self::new(project_id, payload)
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn table(&self) -> &'static str {
        P::TABLE
    }

    pub(crate) fn to_row(&self) -> Result<StoredRow, StorageError> {
        Ok(StoredRow {
            id: self.id,
            project_id: self.project_id,
            payload: serde_json::to_value(&self.payload)?,
            event: self.event,
            synced: self.synced,
            timestamp: self.timestamp,
        })
    }

    pub(crate) fn from_row(row: StoredRow) -> Result<Self, StorageError> {
        Ok(Self {
            id: row.id,
            project_id: row.project_id,
            event: row.event,
            timestamp: row.timestamp,
            synced: row.synced,
            payload: serde_json::from_value(row.payload)?,
        })
    }

    /// Wire form for the message bus: the reading as one flat JSON object.
    pub fn to_message_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(self)?)
    }
}
