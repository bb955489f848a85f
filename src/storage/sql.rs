// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL tier backend: SQLite for the local tier, MySQL for the remote tier.
//!
//! Each sensor type owns one table:
//! ```sql
//! CREATE TABLE environment_readings (
//!   id BIGINT PRIMARY KEY AUTO_INCREMENT,  -- tier-local key
//!   project_id BIGINT NOT NULL,
//!   payload LONGTEXT NOT NULL,             -- sensor fields as JSON text
//!   event BIGINT NOT NULL,
//!   synced BIGINT NOT NULL,
//!   timestamp BIGINT NOT NULL,             -- epoch millis
//!   INDEX idx_project_ts (project_id, timestamp)
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! Flags are stored as integers, and the payload as TEXT rather than a native
//! JSON column, because the `Any` driver maps neither MySQL's JSON nor its
//! TINYINT cleanly. MySQL LONGTEXT also comes back as bytes, so text columns
//! are read as `String` first and `Vec<u8>` second.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use super::traits::{validate_table, StorageError, StoredRow, TierStore};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct SqlTierStore {
    pool: AnyPool,
    is_sqlite: bool,
    /// Tables whose schema has been created on this connection string
    ready_tables: DashSet<String>,
}

impl SqlTierStore {
    /// Connect eagerly with startup-mode retry (fails fast if config is wrong).
    ///
    /// Used for the local tier, which must be available before ingestion starts.
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 4 } else { 8 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self::from_pool(pool, is_sqlite);

        // Enable WAL mode for SQLite (readers don't block the reconciler's writes)
        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        info!(sqlite = is_sqlite, "SQL tier connected");
        Ok(store)
    }

    /// Build a pool without connecting.
    ///
    /// Used for the remote tier: the device may boot offline, so connections
    /// are opened on first use and schema creation is deferred to it.
    pub fn connect_lazy(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        let pool = AnyPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(120))
            .connect_lazy(connection_string)
            .map_err(backend)?;

        Ok(Self::from_pool(pool, is_sqlite))
    }

    fn from_pool(pool: AnyPool, is_sqlite: bool) -> Self {
        Self {
            pool,
            is_sqlite,
            ready_tables: DashSet::new(),
        }
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    #[must_use]
    pub fn is_sqlite(&self) -> bool {
        self.is_sqlite
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        // FULL keeps every committed reading on disk before the call returns
        sqlx::query("PRAGMA synchronous = FULL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    fn create_table_sql(&self, table: &str) -> Vec<String> {
        if self.is_sqlite {
            vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        project_id INTEGER NOT NULL,
                        payload TEXT NOT NULL,
                        event INTEGER NOT NULL DEFAULT 1,
                        synced INTEGER NOT NULL DEFAULT 0,
                        timestamp INTEGER NOT NULL
                    )"
                ),
                format!("CREATE INDEX IF NOT EXISTS idx_{table}_project_ts ON {table} (project_id, timestamp)"),
                format!("CREATE INDEX IF NOT EXISTS idx_{table}_synced ON {table} (synced, id)"),
            ]
        } else {
            vec![format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                    project_id BIGINT NOT NULL,
                    payload LONGTEXT NOT NULL,
                    event BIGINT NOT NULL DEFAULT 1,
                    synced BIGINT NOT NULL DEFAULT 0,
                    timestamp BIGINT NOT NULL,
                    INDEX idx_project_ts (project_id, timestamp),
                    INDEX idx_synced (synced, id)
                )"
            )]
        }
    }

    fn upsert_sql(&self, table: &str) -> String {
        if self.is_sqlite {
            format!(
                "INSERT INTO {table} (id, project_id, payload, event, synced, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    project_id = excluded.project_id,
                    payload = excluded.payload,
                    event = excluded.event,
                    synced = excluded.synced,
                    timestamp = excluded.timestamp"
            )
        } else {
            format!(
                "INSERT INTO {table} (id, project_id, payload, event, synced, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE
                    project_id = VALUES(project_id),
                    payload = VALUES(payload),
                    event = VALUES(event),
                    synced = VALUES(synced),
                    timestamp = VALUES(timestamp)"
            )
        }
    }

    fn read_text(row: &AnyRow, column: &str) -> Option<String> {
        row.try_get::<String, _>(column).ok().or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    fn read_int(row: &AnyRow, column: &str) -> Result<i64, StorageError> {
        row.try_get::<i64, _>(column)
            .or_else(|_| row.try_get::<i32, _>(column).map(i64::from))
            .or_else(|_| row.try_get::<i16, _>(column).map(i64::from))
            .or_else(|_| row.try_get::<bool, _>(column).map(i64::from))
            .map_err(|e| StorageError::Backend(format!("column '{}': {}", column, e)))
    }

    fn decode_row(row: &AnyRow) -> Result<StoredRow, StorageError> {
        let payload_text = Self::read_text(row, "payload")
            .ok_or_else(|| StorageError::Backend("No payload in row".to_string()))?;

        Ok(StoredRow {
            id: Some(Self::read_int(row, "id")?),
            project_id: Self::read_int(row, "project_id")?,
            payload: serde_json::from_str(&payload_text)?,
            event: Self::read_int(row, "event")? != 0,
            synced: Self::read_int(row, "synced")? != 0,
            timestamp: Self::read_int(row, "timestamp")?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, project_id, payload, event, synced, timestamp";

#[async_trait]
impl TierStore for SqlTierStore {
    async fn ensure_table(&self, table: &str) -> Result<(), StorageError> {
        if self.ready_tables.contains(table) {
            return Ok(());
        }
        validate_table(table)?;

        for statement in self.create_table_sql(table) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }

        self.ready_tables.insert(table.to_string());
        debug!(table, "Table schema ready");
        Ok(())
    }

    async fn insert(&self, table: &str, row: &StoredRow) -> Result<i64, StorageError> {
        self.ensure_table(table).await?;
        let payload = serde_json::to_string(&row.payload)?;

        if let Some(id) = row.id {
            let sql = format!(
                "INSERT INTO {table} (id, project_id, payload, event, synced, timestamp) VALUES (?, ?, ?, ?, ?, ?)"
            );
            sqlx::query(&sql)
                .bind(id)
                .bind(row.project_id)
                .bind(payload)
                .bind(i64::from(row.event))
                .bind(i64::from(row.synced))
                .bind(row.timestamp)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            return Ok(id);
        }

        let sql = format!(
            "INSERT INTO {table} (project_id, payload, event, synced, timestamp) VALUES (?, ?, ?, ?, ?)"
        );
        let result = sqlx::query(&sql)
            .bind(row.project_id)
            .bind(payload)
            .bind(i64::from(row.event))
            .bind(i64::from(row.synced))
            .bind(row.timestamp)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        result
            .last_insert_id()
            .ok_or_else(|| StorageError::Backend(format!("no id returned for insert into {}", table)))
    }

    async fn upsert(&self, table: &str, row: &StoredRow) -> Result<(), StorageError> {
        self.ensure_table(table).await?;
        let id = row.require_id()?;
        let payload = serde_json::to_string(&row.payload)?;

        sqlx::query(&self.upsert_sql(table))
            .bind(id)
            .bind(row.project_id)
            .bind(payload)
            .bind(i64::from(row.event))
            .bind(i64::from(row.synced))
            .bind(row.timestamp)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn update(&self, table: &str, row: &StoredRow) -> Result<bool, StorageError> {
        self.ensure_table(table).await?;
        let id = row.require_id()?;
        let payload = serde_json::to_string(&row.payload)?;

        let sql = format!(
            "UPDATE {table} SET project_id = ?, payload = ?, event = ?, synced = ?, timestamp = ? WHERE id = ?"
        );
        let result = sqlx::query(&sql)
            .bind(row.project_id)
            .bind(payload)
            .bind(i64::from(row.event))
            .bind(i64::from(row.synced))
            .bind(row.timestamp)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_project(&self, table: &str, project_id: i64) -> Result<u64, StorageError> {
        self.ensure_table(table).await?;
        let sql = format!("DELETE FROM {table} WHERE project_id = ?");
        let result = sqlx::query(&sql)
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn get_by_id(&self, table: &str, id: i64) -> Result<Option<StoredRow>, StorageError> {
        self.ensure_table(table).await?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM {table} WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn get_by_project(&self, table: &str, project_id: i64) -> Result<Vec<StoredRow>, StorageError> {
        self.ensure_table(table).await?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {table} WHERE project_id = ? ORDER BY timestamp, id"
        );
        let rows = sqlx::query(&sql)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::decode_row).collect()
    }

    async fn exists_by_project(&self, table: &str, project_id: i64) -> Result<bool, StorageError> {
        self.ensure_table(table).await?;
        let sql = format!("SELECT 1 FROM {table} WHERE project_id = ? LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.is_some())
    }

    async fn scan_unsynced(
        &self,
        table: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StorageError> {
        self.ensure_table(table).await?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {table} WHERE synced = 0 AND id > ? ORDER BY id LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(after_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::decode_row).collect()
    }

    async fn set_synced(&self, table: &str, id: i64, synced: bool) -> Result<(), StorageError> {
        self.ensure_table(table).await?;
        let sql = format!("UPDATE {table} SET synced = ? WHERE id = ?");
        let result = sqlx::query(&sql)
            .bind(i64::from(synced))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn confirm_synced(&self, table: &str, expected: &StoredRow) -> Result<bool, StorageError> {
        self.ensure_table(table).await?;
        let id = expected.require_id()?;
        let payload = serde_json::to_string(&expected.payload)?;

        let sql = format!(
            "UPDATE {table} SET synced = 1
             WHERE id = ? AND project_id = ? AND payload = ? AND event = ? AND timestamp = ?"
        );
        let confirmed = sqlx::query(&sql)
            .bind(id)
            .bind(expected.project_id)
            .bind(payload)
            .bind(i64::from(expected.event))
            .bind(expected.timestamp)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if confirmed.rows_affected() > 0 {
            return Ok(true);
        }

        // Rewritten since the snapshot: make sure the newer content is replayed
        let sql = format!("UPDATE {table} SET synced = 0 WHERE id = ?");
        sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(false)
    }
}
