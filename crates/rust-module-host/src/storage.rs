//! SQLite-backed key-value store handed to modules

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use rust_module_host_sdk::host::KeyValueStore;
use rust_module_host_sdk::HandlerError;
use serde_json::Value as JsonValue;

const DATABASE_FILE: &str = "rust_module_host.db";

/// JSON documents grouped into named collections
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the store in `data_dir` and migrate it
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
        let db_path = data_dir.join(DATABASE_FILE);
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database at {:?}", db_path))?;

        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS kv (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (collection, id)
            );
            "#,
            )
            .context("Failed to migrate key-value table")?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn storage_error(err: rusqlite::Error) -> HandlerError {
    tracing::error!(error = %err, "Storage operation failed");
    HandlerError::StorageError(err.to_string())
}

fn decode(raw: String) -> Result<JsonValue, HandlerError> {
    serde_json::from_str(&raw).map_err(|e| HandlerError::StorageError(format!("corrupt value: {}", e)))
}

impl KeyValueStore for SqliteStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<JsonValue>, HandlerError> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM kv WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_error)?;
        raw.map(decode).transpose()
    }

    fn get_all(&self, collection: &str) -> Result<Vec<(String, JsonValue)>, HandlerError> {
        let rows: Vec<(String, String)> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare("SELECT id, value FROM kv WHERE collection = ?1 ORDER BY id")
                .map_err(storage_error)?;
            let rows = stmt
                .query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(storage_error)?;
            let collected = rows.collect::<Result<Vec<_>, _>>().map_err(storage_error)?;
            collected
        };

        rows.into_iter()
            .map(|(id, raw)| Ok((id, decode(raw)?)))
            .collect()
    }

    fn set(&self, collection: &str, id: &str, value: JsonValue) -> Result<(), HandlerError> {
        let raw = serde_json::to_string(&value)?;
        self.conn()
            .execute(
                "INSERT INTO kv (collection, id, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(collection, id) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
                params![collection, id, raw],
            )
            .map_err(storage_error)?;
        Ok(())
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool, HandlerError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM kv WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )
            .map_err(storage_error)?;
        Ok(affected > 0)
    }

    fn exists(&self, collection: &str, id: &str) -> Result<bool, HandlerError> {
        self.conn()
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM kv WHERE collection = ?1 AND id = ?2)",
                params![collection, id],
                |row| row.get(0),
            )
            .map_err(storage_error)
    }
}
