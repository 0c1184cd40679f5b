//! Data models for storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siphon_core::CacheInfo;

/// A cached response keyed by URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Row identifier.
    pub id: i64,
    /// Request URL (unique).
    pub url: String,
    /// Body location relative to the cache root (`stored = false`) or the
    /// library root (`stored = true`).
    pub path: String,
    /// Headers and freshness metadata.
    pub info: CacheInfo,
    /// True once promoted into permanent storage.
    pub stored: bool,
    /// Last write time.
    pub time: DateTime<Utc>,
}

/// Metadata update for one promotion or re-pathing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveInstruction {
    /// Row identifier.
    pub id: i64,
    /// URL of the record being moved.
    pub url: String,
    /// Current relative path.
    pub path_from: String,
    /// New relative path.
    pub path_to: String,
    /// Current placement.
    pub stored: bool,
    /// Placement after the move.
    pub will_be_stored: bool,
}

impl MoveInstruction {
    /// Moves `record` to `path_to` in permanent storage.
    pub fn promote(record: &CacheRecord, path_to: impl Into<String>) -> Self {
        Self {
            id: record.id,
            url: record.url.clone(),
            path_from: record.path.clone(),
            path_to: path_to.into(),
            stored: record.stored,
            will_be_stored: true,
        }
    }
}

/// Configuration key-value pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration key.
    pub key: String,
    /// JSON value.
    pub value: serde_json::Value,
}
