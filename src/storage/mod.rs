// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tier backends: SQL (SQLite local / MySQL remote) and in-memory.

pub mod memory;
pub mod sql;
pub mod traits;

pub use memory::MemoryTierStore;
pub use sql::SqlTierStore;
pub use traits::{StorageError, StoredRow, Tier, TierStore};
