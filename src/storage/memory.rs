// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory tier, used as the remote tier in tests and on devices that run
//! without a system of record.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{validate_table, StorageError, StoredRow, TierStore};

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, StoredRow>,
}

pub struct MemoryTierStore {
    tables: DashMap<String, Table>,
}

impl MemoryTierStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    /// Number of rows in a table (0 if the table does not exist)
    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Check if a table is empty
    #[must_use]
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Snapshot of every row of a table, ascending by id
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all tables
    pub fn clear(&self) {
        self.tables.clear();
    }
}

impl Default for MemoryTierStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TierStore for MemoryTierStore {
    async fn ensure_table(&self, table: &str) -> Result<(), StorageError> {
        validate_table(table)?;
        self.tables.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn insert(&self, table: &str, row: &StoredRow) -> Result<i64, StorageError> {
        validate_table(table)?;
        let mut entry = self.tables.entry(table.to_string()).or_default();
        let id = match row.id {
            Some(id) => {
                if entry.rows.contains_key(&id) {
                    return Err(StorageError::Backend(format!(
                        "duplicate key {} in {}",
                        id, table
                    )));
                }
                id
            }
            None => entry.next_id + 1,
        };
        entry.next_id = entry.next_id.max(id);
        let mut stored = row.clone();
        stored.id = Some(id);
        entry.rows.insert(id, stored);
        Ok(id)
    }

    async fn upsert(&self, table: &str, row: &StoredRow) -> Result<(), StorageError> {
        validate_table(table)?;
        let id = row.require_id()?;
        let mut entry = self.tables.entry(table.to_string()).or_default();
        entry.next_id = entry.next_id.max(id);
        entry.rows.insert(id, row.clone());
        Ok(())
    }

    async fn update(&self, table: &str, row: &StoredRow) -> Result<bool, StorageError> {
        let id = row.require_id()?;
        let Some(mut entry) = self.tables.get_mut(table) else {
            return Ok(false);
        };
        match entry.rows.get_mut(&id) {
            Some(existing) => {
                *existing = row.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_by_project(&self, table: &str, project_id: i64) -> Result<u64, StorageError> {
        let Some(mut entry) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = entry.rows.len();
        entry.rows.retain(|_, r| r.project_id != project_id);
        Ok((before - entry.rows.len()) as u64)
    }

    async fn get_by_id(&self, table: &str, id: i64) -> Result<Option<StoredRow>, StorageError> {
        Ok(self.tables.get(table).and_then(|t| t.rows.get(&id).cloned()))
    }

    async fn get_by_project(&self, table: &str, project_id: i64) -> Result<Vec<StoredRow>, StorageError> {
        let mut rows: Vec<StoredRow> = self
            .tables
            .get(table)
            .map(|t| {
                t.rows
                    .values()
                    .filter(|r| r.project_id == project_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|r| (r.timestamp, r.id));
        Ok(rows)
    }

    async fn exists_by_project(&self, table: &str, project_id: i64) -> Result<bool, StorageError> {
        Ok(self
            .tables
            .get(table)
            .is_some_and(|t| t.rows.values().any(|r| r.project_id == project_id)))
    }

    async fn scan_unsynced(
        &self,
        table: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StorageError> {
        Ok(self
            .tables
            .get(table)
            .map(|t| {
                t.rows
                    .range(after_id.saturating_add(1)..)
                    .map(|(_, r)| r)
                    .filter(|r| !r.synced)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_synced(&self, table: &str, id: i64, synced: bool) -> Result<(), StorageError> {
        let mut entry = self.tables.get_mut(table).ok_or(StorageError::NotFound)?;
        let row = entry.rows.get_mut(&id).ok_or(StorageError::NotFound)?;
        row.synced = synced;
        Ok(())
    }

    async fn confirm_synced(&self, table: &str, expected: &StoredRow) -> Result<bool, StorageError> {
        let id = expected.require_id()?;
        let Some(mut entry) = self.tables.get_mut(table) else {
            return Ok(false);
        };
        let Some(row) = entry.rows.get_mut(&id) else {
            return Ok(false);
        };
        // Compare and flag under the same shard lock
        let current = row.same_content(expected);
        row.synced = current;
        Ok(current)
    }
}
