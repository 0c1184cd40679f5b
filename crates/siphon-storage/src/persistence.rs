//! Persistence adapter consumed by the cache store.
//!
//! Only metadata lives behind this trait; body files are placed and renamed
//! by [`crate::CacheStore`]. [`crate::Database`] is the SQLite implementation.

use siphon_core::CacheInfo;

use crate::error::Result;
use crate::models::{CacheRecord, MoveInstruction};

/// Durable key/value storage for cache records, keyed by URL.
pub trait CachePersistence: Send + Sync {
    /// Record for `url`, if any.
    fn lookup_by_url(&self, url: &str) -> Result<Option<CacheRecord>>;

    /// Records for every known URL in `urls`.
    fn lookup_by_urls(&self, urls: &[String]) -> Result<Vec<CacheRecord>>;

    /// Insert or replace the record for `url`.
    fn upsert(&self, url: &str, path: &str, info: &CacheInfo, stored: bool) -> Result<CacheRecord>;

    /// Remove the record for `url`. Returns true if one existed.
    fn delete_by_url(&self, url: &str) -> Result<bool>;

    /// Re-path a single record.
    fn move_path(&self, id: i64, new_path: &str, will_be_stored: bool) -> Result<CacheRecord>;

    /// Re-path several records atomically.
    fn batch_move(&self, instructions: &[MoveInstruction]) -> Result<()>;
}
