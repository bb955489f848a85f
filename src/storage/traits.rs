// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::resilience::retry::Retryable;

/// One of the two storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Device-local store, always available
    Local,
    /// System of record, reachable only when online
    Remote,
}

impl Tier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Row not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("{tier} tier call timed out after {after:?}")]
    Timeout { tier: Tier, after: Duration },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A reading as persisted in a tier: fixed columns plus the sensor fields as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Tier-local key; `None` before the local tier assigns one
    pub id: Option<i64>,
    pub project_id: i64,
    pub payload: Value,
    pub event: bool,
    pub synced: bool,
    /// Creation time (epoch millis)
    pub timestamp: i64,
}

impl StoredRow {
    pub(crate) fn require_id(&self) -> Result<i64, StorageError> {
        self.id
            .ok_or_else(|| StorageError::InvalidInput("row has no id".to_string()))
    }

    /// Same logical content, ignoring `id` and `synced`.
    #[must_use]
    pub fn same_content(&self, other: &StoredRow) -> bool {
        self.project_id == other.project_id
            && self.timestamp == other.timestamp
            && self.event == other.event
            && self.payload == other.payload
    }
}

/// Parameterized CRUD against one table per sensor type.
///
/// Tables are keyed by `id` and indexed by `(project_id, timestamp)`.
/// Implementations must not retry internally: timeouts and fallback are the
/// governor's job.
#[async_trait]
pub trait TierStore: Send + Sync {
    /// Create the table if missing. Idempotent.
    async fn ensure_table(&self, table: &str) -> Result<(), StorageError>;

    /// Insert a new row, returning its id. A preset `row.id` is kept as the key.
    async fn insert(&self, table: &str, row: &StoredRow) -> Result<i64, StorageError>;

    /// Insert or overwrite the row with `row.id`.
    async fn upsert(&self, table: &str, row: &StoredRow) -> Result<(), StorageError>;

    /// Update the row with `row.id` in place. Returns false if no such row.
    async fn update(&self, table: &str, row: &StoredRow) -> Result<bool, StorageError>;

    /// Delete every row of a project. Returns the number removed.
    async fn delete_by_project(&self, table: &str, project_id: i64) -> Result<u64, StorageError>;

    async fn get_by_id(&self, table: &str, id: i64) -> Result<Option<StoredRow>, StorageError>;

    /// Rows of a project ordered by timestamp.
    async fn get_by_project(&self, table: &str, project_id: i64) -> Result<Vec<StoredRow>, StorageError>;

    async fn exists_by_project(&self, table: &str, project_id: i64) -> Result<bool, StorageError>;

    /// Unsynced rows with `id > after_id`, ascending by id, at most `limit`.
    async fn scan_unsynced(
        &self,
        table: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StorageError>;

    /// Set the `synced` flag on one row. `NotFound` if the row is missing.
    async fn set_synced(&self, table: &str, id: i64, synced: bool) -> Result<(), StorageError>;

    /// Mark row `expected.id` synced only if it still holds `expected`'s
    /// content (`project_id`, `payload`, `event`, `timestamp`).
    ///
    /// A row whose content has moved on is flagged unsynced instead and
    /// `false` is returned. A missing row also returns `false`.
    async fn confirm_synced(&self, table: &str, expected: &StoredRow) -> Result<bool, StorageError>;
}

/// Table names are interpolated into SQL, so only `[a-z0-9_]` is accepted.
pub(crate) fn validate_table(table: &str) -> Result<(), StorageError> {
    let valid = !table.is_empty()
        && table.len() <= 64
        && table
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidInput(format!("invalid table name '{}'", table)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StorageError::Backend("conn reset".into()).is_retryable());
        assert!(StorageError::Timeout { tier: Tier::Remote, after: Duration::from_secs(3) }.is_retryable());
        assert!(!StorageError::InvalidInput("x".into()).is_retryable());
        assert!(!StorageError::Serialization("x".into()).is_retryable());
        assert!(!StorageError::NotFound.is_retryable());
    }

    #[test]
    fn test_validate_table() {
        assert!(validate_table("environment_readings").is_ok());
        assert!(validate_table("gps2").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table("readings; DROP TABLE x").is_err());
        assert!(validate_table("Readings").is_err());
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(Tier::Local.to_string(), "local");
        assert_eq!(Tier::Remote.to_string(), "remote");
    }
}
