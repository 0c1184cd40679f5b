//! Cache bodies on disk plus their records.
//!
//! Bodies live in one of two roots:
//!
//! ```text
//! cache_dir/<sha256(url)>          stored = false  (ephemeral)
//! library_dir/<caller chosen path> stored = true   (promoted)
//! ```
//!
//! Promotion is a rename between the roots, never a copy. Writers and
//! moves of the same URL are serialized per store instance; bodies are written to a
//! sibling `.part` file and renamed into place so readers never see a torn
//! file. Separate processes sharing one database remain last-write-wins.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use siphon_core::{Body, CacheInfo};

use crate::error::{Result, StorageError};
use crate::models::{CacheRecord, MoveInstruction};
use crate::persistence::CachePersistence;

/// Filesystem roots for cached bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoots {
    /// Ephemeral cache directory.
    pub cache_dir: PathBuf,
    /// Permanent (curated) library directory.
    pub library_dir: PathBuf,
}

impl StorageRoots {
    /// Roots below a common data directory.
    pub fn under(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            cache_dir: data_dir.join("cache"),
            library_dir: data_dir.join("library"),
        }
    }

    fn root(&self, stored: bool) -> &Path {
        if stored {
            &self.library_dir
        } else {
            &self.cache_dir
        }
    }
}

/// Cache record and body store.
pub struct CacheStore {
    persistence: Arc<dyn CachePersistence>,
    roots: StorageRoots,
    known_dirs: Mutex<HashSet<PathBuf>>,
    url_locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("roots", &self.roots)
            .field("known_dirs", &self.known_dirs.lock().len())
            .finish()
    }
}

impl CacheStore {
    /// Creates a store over a persistence adapter.
    pub fn new(persistence: Arc<dyn CachePersistence>, roots: StorageRoots) -> Self {
        Self {
            persistence,
            roots,
            known_dirs: Mutex::new(HashSet::new()),
            url_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Filesystem roots.
    pub fn roots(&self) -> &StorageRoots {
        &self.roots
    }

    /// Underlying persistence adapter.
    pub fn persistence(&self) -> &Arc<dyn CachePersistence> {
        &self.persistence
    }

    /// Absolute location of a record's body.
    pub fn resolve_path(&self, record: &CacheRecord) -> PathBuf {
        self.roots.root(record.stored).join(&record.path)
    }

    /// Looks up a record. A record whose body file has disappeared is
    /// deleted and reported as absent.
    pub async fn lookup(&self, url: &str) -> Result<Option<CacheRecord>> {
        let Some(record) = self.persistence.lookup_by_url(url)? else {
            return Ok(None);
        };

        let path = self.resolve_path(&record);
        if tokio::fs::try_exists(&path).await? {
            return Ok(Some(record));
        }

        tracing::warn!("Body for {} missing at {:?}, dropping record", url, path);
        self.persistence.delete_by_url(url)?;
        Ok(None)
    }

    /// Reads a record's body in the form it was captured.
    pub async fn read_body(&self, record: &CacheRecord) -> Result<Body> {
        let bytes = tokio::fs::read(self.resolve_path(record)).await?;
        if record.info.body_is_binary {
            Ok(Body::from_bytes(&bytes))
        } else {
            Ok(Body::text(String::from_utf8_lossy(&bytes).into_owned()))
        }
    }

    /// Writes a body and upserts its record.
    ///
    /// An existing record keeps its path and placement and its file is
    /// overwritten in place; a new record gets an ephemeral path derived
    /// from the URL.
    pub async fn put(&self, url: &str, mut info: CacheInfo, body: &Body) -> Result<CacheRecord> {
        let bytes = body
            .to_bytes()
            .map_err(|e| StorageError::InvalidBody(e.to_string()))?;
        info.body_is_binary = body.encoded;

        let lock = self.url_lock(url);
        let _guard = lock.lock().await;

        let (relative, stored) = match self.persistence.lookup_by_url(url)? {
            Some(existing) => (existing.path, existing.stored),
            None => (storage_key(url), false),
        };

        let target = self.roots.root(stored).join(&relative);
        if let Some(parent) = target.parent() {
            self.ensure_dir(parent).await?;
        }
        write_atomic(&target, &bytes).await?;

        let record = self.persistence.upsert(url, &relative, &info, stored)?;
        tracing::debug!("Cached {} ({} bytes) at {:?}", url, bytes.len(), target);
        Ok(record)
    }

    /// Rewrites only the metadata of an existing record.
    pub async fn update_info(&self, url: &str, info: CacheInfo) -> Result<Option<CacheRecord>> {
        let lock = self.url_lock(url);
        let _guard = lock.lock().await;

        match self.persistence.lookup_by_url(url)? {
            Some(existing) => Ok(Some(self.persistence.upsert(
                url,
                &existing.path,
                &info,
                existing.stored,
            )?)),
            None => Ok(None),
        }
    }

    /// Moves a batch of records.
    ///
    /// Each record is renamed independently; a failed rename is logged and
    /// skipped without affecting the others. Metadata for all successful
    /// renames is then written in one transaction; if that fails every rename
    /// of the batch is undone. Returns the updated records.
    ///
    /// The per-URL lock of every moved record is held until its metadata is
    /// written, so a concurrent `put` cannot resurrect the old placement.
    pub async fn promote(&self, instructions: &[MoveInstruction]) -> Vec<CacheRecord> {
        // URL order keeps concurrent batches from deadlocking on each other.
        let mut ordered: Vec<&MoveInstruction> = instructions.iter().collect();
        ordered.sort_by(|a, b| a.url.cmp(&b.url));
        ordered.dedup_by(|a, b| a.url == b.url);

        let mut guards = Vec::with_capacity(ordered.len());
        let mut moved: Vec<(MoveInstruction, PathBuf, PathBuf)> = Vec::new();

        for instruction in ordered {
            let guard = self.url_lock(&instruction.url).lock_owned().await;
            match self.rename_current(instruction).await {
                Ok((from, to)) => {
                    guards.push(guard);
                    moved.push((instruction.clone(), from, to));
                }
                Err(e) => tracing::warn!(
                    "Promotion of record {} to {:?} skipped: {}",
                    instruction.id,
                    instruction.path_to,
                    e
                ),
            }
        }

        if moved.is_empty() {
            return Vec::new();
        }

        let applied: Vec<MoveInstruction> = moved.iter().map(|(i, _, _)| i.clone()).collect();
        if let Err(e) = self.persistence.batch_move(&applied) {
            tracing::warn!("Promotion metadata update failed, undoing {} renames: {}", moved.len(), e);
            for (_, from, to) in &moved {
                if let Err(e) = tokio::fs::rename(to, from).await {
                    tracing::error!("Could not undo rename {:?} -> {:?}: {}", to, from, e);
                }
            }
            return Vec::new();
        }
        drop(guards);

        let urls: Vec<String> = applied.iter().map(|i| i.url.clone()).collect();
        match self.persistence.lookup_by_urls(&urls) {
            Ok(records) => {
                tracing::info!("Promoted {} of {} records", records.len(), instructions.len());
                records
            }
            Err(e) => {
                tracing::warn!("Promoted records could not be re-read: {}", e);
                Vec::new()
            }
        }
    }

    /// Moves a single record and returns its updated form.
    pub async fn move_record(&self, instruction: &MoveInstruction) -> Result<CacheRecord> {
        let lock = self.url_lock(&instruction.url);
        let _guard = lock.lock().await;

        let (from, to) = self.rename_current(instruction).await?;
        match self
            .persistence
            .move_path(instruction.id, &instruction.path_to, instruction.will_be_stored)
        {
            Ok(record) => Ok(record),
            Err(e) => {
                tokio::fs::rename(&to, &from).await?;
                Err(e)
            }
        }
    }

    /// Renames a record's body after checking the instruction still
    /// describes it. Callers hold the record's URL lock.
    async fn rename_current(&self, instruction: &MoveInstruction) -> Result<(PathBuf, PathBuf)> {
        check_relative(&instruction.path_to)?;

        let current = self
            .persistence
            .lookup_by_url(&instruction.url)?
            .ok_or_else(|| StorageError::NotFound(instruction.url.clone()))?;
        if current.id != instruction.id
            || current.path != instruction.path_from
            || current.stored != instruction.stored
        {
            return Err(StorageError::Conflict(format!(
                "{} is now at {:?} (stored = {})",
                instruction.url, current.path, current.stored
            )));
        }

        let from = self.roots.root(instruction.stored).join(&instruction.path_from);
        let to = self.roots.root(instruction.will_be_stored).join(&instruction.path_to);

        if let Some(parent) = to.parent() {
            self.ensure_dir(parent).await?;
        }
        tokio::fs::rename(&from, &to).await?;
        Ok((from, to))
    }

    /// Creates a directory once per store lifetime.
    async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if self.known_dirs.lock().contains(dir) {
            return Ok(());
        }
        tokio::fs::create_dir_all(dir).await?;
        self.known_dirs.lock().insert(dir.to_path_buf());
        Ok(())
    }

    fn url_lock(&self, url: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.url_locks.lock();
        if let Some(lock) = locks.get(url).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(url.to_string(), Arc::downgrade(&lock));
        lock
    }
}

/// Ephemeral file name for a URL.
pub fn storage_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

fn check_relative(path: &str) -> Result<()> {
    let p = Path::new(path);
    let escapes = path.is_empty()
        || p.components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp: OsString = target.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
