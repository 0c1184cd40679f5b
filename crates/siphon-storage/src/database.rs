//! High-level database interface.

use std::path::PathBuf;
use std::sync::Arc;

use directories::ProjectDirs;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use siphon_core::{CacheInfo, EngineConfig, ENGINE_CONFIG_KEY};
use tracing::info;

use crate::error::{Result, StorageError};
use crate::models::{CacheRecord, Config, MoveInstruction};
use crate::persistence::CachePersistence;
use crate::repository::{ConfigRepo, PathsRepo};
use crate::schema::run_migrations;

/// SQLite-backed persistence for cache records and configuration.
///
/// A single connection behind a mutex; clones share it.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open the database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Open (or create) a database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "siphon", "siphon")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join("siphon.db"))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    // === Cache records ===

    /// All records in permanent storage.
    pub fn all_stored(&self) -> Result<Vec<CacheRecord>> {
        PathsRepo::get_stored(&self.conn())
    }

    /// True when `url` has a record that has not been promoted yet.
    pub fn needs_promotion(&self, url: &str) -> Result<bool> {
        Ok(PathsRepo::get_by_url(&self.conn(), url)?.is_some_and(|r| !r.stored))
    }

    /// Number of cache records.
    pub fn count_records(&self) -> Result<i64> {
        PathsRepo::count(&self.conn())
    }

    // === Config ===

    /// Get a configuration value.
    pub fn get_config(&self, key: &str) -> Result<Option<Config>> {
        ConfigRepo::get(&self.conn(), key)
    }

    /// Set a configuration value.
    pub fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        ConfigRepo::set(&self.conn(), key, value)
    }

    /// Get a typed configuration value with default.
    pub fn get_config_or_default<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T> {
        ConfigRepo::get_or_default(&self.conn(), key, default)
    }

    /// Engine configuration, defaults filled in.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        self.get_config_or_default(ENGINE_CONFIG_KEY, EngineConfig::default())
    }

    /// Persist the engine configuration.
    pub fn set_engine_config(&self, config: &EngineConfig) -> Result<()> {
        self.set_config(ENGINE_CONFIG_KEY, &serde_json::to_value(config)?)
    }
}

impl CachePersistence for Database {
    fn lookup_by_url(&self, url: &str) -> Result<Option<CacheRecord>> {
        PathsRepo::get_by_url(&self.conn(), url)
    }

    fn lookup_by_urls(&self, urls: &[String]) -> Result<Vec<CacheRecord>> {
        PathsRepo::get_by_urls(&self.conn(), urls)
    }

    fn upsert(&self, url: &str, path: &str, info: &CacheInfo, stored: bool) -> Result<CacheRecord> {
        PathsRepo::upsert(&self.conn(), url, path, info, stored)
    }

    fn delete_by_url(&self, url: &str) -> Result<bool> {
        PathsRepo::delete_by_url(&self.conn(), url)
    }

    fn move_path(&self, id: i64, new_path: &str, will_be_stored: bool) -> Result<CacheRecord> {
        let conn = self.conn();
        if !PathsRepo::set_path(&conn, id, new_path, will_be_stored)? {
            return Err(StorageError::NotFound(format!("record {}", id)));
        }
        PathsRepo::get_by_id(&conn, id)?.ok_or_else(|| StorageError::NotFound(format!("record {}", id)))
    }

    fn batch_move(&self, instructions: &[MoveInstruction]) -> Result<()> {
        PathsRepo::apply_moves(&self.conn(), instructions)
    }
}
