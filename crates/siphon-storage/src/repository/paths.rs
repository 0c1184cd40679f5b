//! Cache record repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use siphon_core::CacheInfo;

use crate::error::{Result, StorageError};
use crate::models::{CacheRecord, MoveInstruction};

const SELECT_COLUMNS: &str = "SELECT id, url, path, info, stored, time FROM paths";

/// Row as read from SQLite, before `info` is decoded.
struct RawRecord {
    id: i64,
    url: String,
    path: String,
    info: String,
    stored: bool,
    time: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            url: row.get(1)?,
            path: row.get(2)?,
            info: row.get(3)?,
            stored: row.get::<_, i32>(4)? != 0,
            time: row.get(5)?,
        })
    }

    /// Decodes `info`; rows with malformed metadata are logged and skipped.
    fn decode(self) -> Option<CacheRecord> {
        match serde_json::from_str::<CacheInfo>(&self.info) {
            Ok(info) => Some(CacheRecord {
                id: self.id,
                url: self.url,
                path: self.path,
                info,
                stored: self.stored,
                time: parse_datetime(&self.time),
            }),
            Err(e) => {
                tracing::warn!("Skipping cache record {} with malformed info: {}", self.url, e);
                None
            }
        }
    }
}

/// Repository for cache record operations.
pub struct PathsRepo;

impl PathsRepo {
    /// Get a record by URL.
    pub fn get_by_url(conn: &Connection, url: &str) -> Result<Option<CacheRecord>> {
        let raw = conn
            .query_row(
                &format!("{} WHERE url = ?1", SELECT_COLUMNS),
                [url],
                RawRecord::from_row,
            )
            .optional()?;

        Ok(raw.and_then(RawRecord::decode))
    }

    /// Get a record by ID.
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<CacheRecord>> {
        let raw = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                [id],
                RawRecord::from_row,
            )
            .optional()?;

        Ok(raw.and_then(RawRecord::decode))
    }

    /// Get every record whose URL is in `urls`. Unknown URLs are ignored.
    pub fn get_by_urls(conn: &Connection, urls: &[String]) -> Result<Vec<CacheRecord>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; urls.len()].join(",");
        let mut stmt = conn.prepare(&format!(
            "{} WHERE url IN ({}) ORDER BY id",
            SELECT_COLUMNS, placeholders
        ))?;

        let records = stmt
            .query_map(params_from_iter(urls.iter()), RawRecord::from_row)?
            .filter_map(|r| r.ok())
            .filter_map(RawRecord::decode)
            .collect();

        Ok(records)
    }

    /// Get all records in permanent storage.
    pub fn get_stored(conn: &Connection) -> Result<Vec<CacheRecord>> {
        let mut stmt = conn.prepare(&format!("{} WHERE stored = 1 ORDER BY id", SELECT_COLUMNS))?;

        let records = stmt
            .query_map([], RawRecord::from_row)?
            .filter_map(|r| r.ok())
            .filter_map(RawRecord::decode)
            .collect();

        Ok(records)
    }

    /// Insert or replace the record for `url`, keeping its row ID.
    pub fn upsert(
        conn: &Connection,
        url: &str,
        path: &str,
        info: &CacheInfo,
        stored: bool,
    ) -> Result<CacheRecord> {
        let info_json = serde_json::to_string(info)?;

        conn.execute(
            "INSERT INTO paths (url, path, info, stored, time) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(url) DO UPDATE SET
                path = excluded.path,
                info = excluded.info,
                stored = excluded.stored,
                time = excluded.time",
            params![url, path, info_json, stored as i32, Utc::now().to_rfc3339()],
        )?;

        Self::get_by_url(conn, url)?.ok_or_else(|| StorageError::NotFound(url.to_string()))
    }

    /// Change the path and placement of a record.
    pub fn set_path(conn: &Connection, id: i64, path: &str, stored: bool) -> Result<bool> {
        let updated = conn.execute(
            "UPDATE paths SET path = ?1, stored = ?2 WHERE id = ?3",
            params![path, stored as i32, id],
        )?;
        Ok(updated > 0)
    }

    /// Apply a batch of moves in one transaction.
    pub fn apply_moves(conn: &Connection, instructions: &[MoveInstruction]) -> Result<()> {
        if instructions.is_empty() {
            return Ok(());
        }

        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE paths SET path = ?1, stored = ?2 WHERE id = ?3")?;
            for instruction in instructions {
                stmt.execute(params![
                    instruction.path_to,
                    instruction.will_be_stored as i32,
                    instruction.id
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete the record for `url`.
    pub fn delete_by_url(conn: &Connection, url: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM paths WHERE url = ?1", [url])?;
        Ok(deleted > 0)
    }

    /// Count all records.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM paths", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Parse a datetime from SQLite format.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}
