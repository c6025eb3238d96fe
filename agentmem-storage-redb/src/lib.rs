#![allow(clippy::excessive_nesting)]

//! # Agentmem Storage - redb
//!
//! redb embedded database as the durable store of the memory substrate.
//!
//! This crate provides:
//! - Crash-safe single-file persistence for each memory tier
//! - Deterministic key-ordered prefix scans
//! - Async wrappers over synchronous redb transactions via `spawn_blocking`
//! - Atomic multi-operation batches in one write transaction
//!
//! ## Example
//!
//! ```no_run
//! use agentmem_storage_redb::RedbStore;
//! use std::path::Path;
//!
//! # async fn example() -> agentmem_core::Result<()> {
//! let store = RedbStore::open(Path::new("./memory/episodic.db")).await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agentmem_core::backend::{BatchOp, DurableStore};
use agentmem_core::{Error, Result};
use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::{debug, info};

// Single keyspace per file; tiers get separate files.
const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Timeout for database operations (10 seconds)
const DB_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Execute a blocking database operation with a timeout.
async fn with_db_timeout<T, F>(operation: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(DB_OPERATION_TIMEOUT, tokio::task::spawn_blocking(operation)).await
    {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(Error::Storage(format!("Task join error: {join_err}"))),
        Err(_) => Err(Error::Storage(format!(
            "Database operation timed out after {DB_OPERATION_TIMEOUT:?}"
        ))),
    }
}

/// Durable store backed by one redb file.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database file and ensure the table exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path = path.to_path_buf();
        let db = with_db_timeout(move || {
            let db = Database::create(&path)
                .map_err(|e| Error::Storage(format!("Failed to open redb database: {e}")))?;

            // Create the table up front so empty scans do not fail.
            let write_txn = db
                .begin_write()
                .map_err(|e| Error::Storage(format!("Failed to begin write transaction: {e}")))?;
            write_txn
                .open_table(RECORDS_TABLE)
                .map_err(|e| Error::Storage(format!("Failed to open records table: {e}")))?;
            write_txn
                .commit()
                .map_err(|e| Error::Storage(format!("Failed to commit transaction: {e}")))?;
            Ok(db)
        })
        .await?;

        info!("Opened redb durable store");
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl DurableStore for RedbStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();

        with_db_timeout(move || {
            let read_txn = db
                .begin_read()
                .map_err(|e| Error::Storage(format!("Failed to begin read transaction: {e}")))?;
            let table = read_txn
                .open_table(RECORDS_TABLE)
                .map_err(|e| Error::Storage(format!("Failed to open records table: {e}")))?;
            let value = table
                .get(key.as_str())
                .map_err(|e| Error::Storage(format!("Failed to get record: {e}")))?
                .map(|guard| guard.value().to_vec());
            Ok(value)
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let db = Arc::clone(&self.db);
        let owned_key = key.to_string();
        let value = value.to_vec();

        with_db_timeout(move || {
            let key = owned_key;
            let write_txn = db
                .begin_write()
                .map_err(|e| Error::Storage(format!("Failed to begin write transaction: {e}")))?;
            {
                let mut table = write_txn
                    .open_table(RECORDS_TABLE)
                    .map_err(|e| Error::Storage(format!("Failed to open records table: {e}")))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(|e| Error::Storage(format!("Failed to insert record: {e}")))?;
            }
            write_txn
                .commit()
                .map_err(|e| Error::Storage(format!("Failed to commit transaction: {e}")))?;
            Ok(())
        })
        .await?;

        debug!(key, "stored record");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();

        with_db_timeout(move || {
            let write_txn = db
                .begin_write()
                .map_err(|e| Error::Storage(format!("Failed to begin write transaction: {e}")))?;
            let existed = {
                let mut table = write_txn
                    .open_table(RECORDS_TABLE)
                    .map_err(|e| Error::Storage(format!("Failed to open records table: {e}")))?;
                table
                    .remove(key.as_str())
                    .map_err(|e| Error::Storage(format!("Failed to delete record: {e}")))?
                    .is_some()
            };
            write_txn
                .commit()
                .map_err(|e| Error::Storage(format!("Failed to commit transaction: {e}")))?;
            Ok(existed)
        })
        .await
    }

    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        let db = Arc::clone(&self.db);
        let prefix = prefix.to_string();

        with_db_timeout(move || {
            let read_txn = db
                .begin_read()
                .map_err(|e| Error::Storage(format!("Failed to begin read transaction: {e}")))?;
            let table = read_txn
                .open_table(RECORDS_TABLE)
                .map_err(|e| Error::Storage(format!("Failed to open records table: {e}")))?;

            // redb iterates in ascending key order, which is exactly the
            // deterministic order the scan contract requires.
            let mut entries = Vec::new();
            let range = table
                .range(prefix.as_str()..)
                .map_err(|e| Error::Storage(format!("Failed to range records: {e}")))?;
            for item in range {
                let (key_guard, value_guard) =
                    item.map_err(|e| Error::Storage(format!("Failed to read record entry: {e}")))?;
                let key = key_guard.value();
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                entries.push((key.to_string(), value_guard.value().to_vec()));
                if entries.len() >= limit {
                    break;
                }
            }
            Ok(entries)
        })
        .await
    }

    async fn apply_batch(&self, batch: Vec<BatchOp>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let db = Arc::clone(&self.db);

        with_db_timeout(move || {
            let write_txn = db
                .begin_write()
                .map_err(|e| Error::Storage(format!("Failed to begin write transaction: {e}")))?;
            {
                let mut table = write_txn
                    .open_table(RECORDS_TABLE)
                    .map_err(|e| Error::Storage(format!("Failed to open records table: {e}")))?;
                for op in batch {
                    match op {
                        BatchOp::Put { key, value } => {
                            table
                                .insert(key.as_str(), value.as_slice())
                                .map_err(|e| {
                                    Error::Storage(format!("Failed to insert record: {e}"))
                                })?;
                        }
                        BatchOp::Delete { key } => {
                            table.remove(key.as_str()).map_err(|e| {
                                Error::Storage(format!("Failed to delete record: {e}"))
                            })?;
                        }
                    }
                }
            }
            write_txn
                .commit()
                .map_err(|e| Error::Storage(format!("Failed to commit transaction: {e}")))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> RedbStore {
        RedbStore::open(&dir.path().join("records.db")).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.put("memory:episodic:a", b"payload").await.unwrap();
        assert_eq!(
            store.get("memory:episodic:a").await.unwrap(),
            Some(b"payload".to_vec())
        );

        assert!(store.delete("memory:episodic:a").await.unwrap());
        assert!(!store.delete("memory:episodic:a").await.unwrap());
        assert!(store.get("memory:episodic:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_is_prefix_bounded_and_ordered() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.put("memory:episodic:c", b"3").await.unwrap();
        store.put("memory:episodic:a", b"1").await.unwrap();
        store.put("memory:episodic:b", b"2").await.unwrap();
        store.put("memory:semantic:x", b"9").await.unwrap();

        let entries = store.scan("memory:episodic:", 10).await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["memory:episodic:a", "memory:episodic:b", "memory:episodic:c"]
        );

        let limited = store.scan("memory:episodic:", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.db");

        {
            let store = RedbStore::open(&path).await.unwrap();
            store.put("k", b"durable").await.unwrap();
        }

        let reopened = RedbStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), Some(b"durable".to_vec()));
    }

    #[tokio::test]
    async fn test_batch_applies_atomically() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.put("old", b"x").await.unwrap();

        store
            .apply_batch(vec![
                BatchOp::Put {
                    key: "new-1".to_string(),
                    value: b"a".to_vec(),
                },
                BatchOp::Put {
                    key: "new-2".to_string(),
                    value: b"b".to_vec(),
                },
                BatchOp::Delete {
                    key: "old".to_string(),
                },
            ])
            .await
            .unwrap();

        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("new-1").await.unwrap().is_some());
        assert!(store.get("new-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_scan_on_fresh_store() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        assert!(store.scan("anything:", 10).await.unwrap().is_empty());
    }
}
