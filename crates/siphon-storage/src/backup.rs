//! JSON backup of promoted records.
//!
//! The library directory survives a lost or corrupted database, but the
//! records pointing into it do not. A dump of every stored record is written
//! alongside the database and replayed when the records table comes up empty.

use std::path::Path;

use serde::{Deserialize, Serialize};
use siphon_core::CacheInfo;
use tracing::{info, warn};

use crate::database::Database;
use crate::error::Result;
use crate::persistence::CachePersistence;

/// One promoted record as written to the backup file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub url: String,
    pub path: String,
    pub info: CacheInfo,
    #[serde(default = "default_stored")]
    pub stored: bool,
}

fn default_stored() -> bool {
    true
}

/// Writes every stored record to `path`. Returns the number written.
pub fn dump_stored(db: &Database, path: &Path) -> Result<usize> {
    let entries: Vec<BackupEntry> = db
        .all_stored()?
        .into_iter()
        .map(|r| BackupEntry {
            url: r.url,
            path: r.path,
            info: r.info,
            stored: r.stored,
        })
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(&entries)?)?;

    info!("Backed up {} stored records to {:?}", entries.len(), path);
    Ok(entries.len())
}

/// Replays a backup into an empty records table.
///
/// Does nothing when records already exist or the file is absent.
pub fn restore_if_empty(db: &Database, path: &Path) -> Result<usize> {
    if db.count_records()? > 0 {
        return Ok(0);
    }
    if !path.exists() {
        return Ok(0);
    }

    let entries: Vec<BackupEntry> = match serde_json::from_slice(&std::fs::read(path)?) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Ignoring malformed backup {:?}: {}", path, e);
            return Ok(0);
        }
    };
    let mut restored = 0;
    for entry in &entries {
        match db.upsert(&entry.url, &entry.path, &entry.info, entry.stored) {
            Ok(_) => restored += 1,
            Err(e) => warn!("Could not restore {}: {}", entry.url, e),
        }
    }

    info!("Restored {} of {} records from {:?}", restored, entries.len(), path);
    Ok(restored)
}
