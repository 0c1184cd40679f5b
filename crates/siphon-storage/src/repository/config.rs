//! Configuration repository (the key/value "vault").

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::Config;

/// Repository for configuration operations.
pub struct ConfigRepo;

impl ConfigRepo {
    /// Get a configuration value. Values that are not valid JSON read as null.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Config>> {
        let value: Option<String> = conn
            .query_row("SELECT value FROM config WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;

        Ok(value.map(|raw| Config {
            key: key.to_string(),
            value: serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Config value {} is not valid JSON: {}", key, e);
                serde_json::Value::Null
            }),
        }))
    }

    /// Set a configuration value (insert or update).
    pub fn set(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    /// Delete a configuration value.
    pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
        Ok(conn.execute("DELETE FROM config WHERE key = ?1", [key])? > 0)
    }

    /// Get a typed configuration value, falling back to `default` when the
    /// key is missing or does not decode.
    pub fn get_or_default<T: serde::de::DeserializeOwned>(
        conn: &Connection,
        key: &str,
        default: T,
    ) -> Result<T> {
        let Some(config) = Self::get(conn, key)? else {
            return Ok(default);
        };
        match serde_json::from_value(config.value) {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!("Config {} does not decode, using default: {}", key, e);
                Ok(default)
            }
        }
    }
}
