//! Debounced batch promotion.
//!
//! Callers queue `(url, path)` pairs as they learn which cached assets are
//! worth keeping. The batch is promoted once no new pair has arrived for the
//! debounce delay; every arrival pushes the deadline back. Shutdown flushes
//! whatever is pending before the task exits. A batcher built with
//! [`PromotionBatcher::spawn_with_backup`] rewrites the backup file after
//! every batch that moved something.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use siphon_storage::{backup, CachePersistence, CacheStore, Database, MoveInstruction};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

enum Message {
    Queue { url: String, path_to: String },
    Flush(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<usize>),
}

struct BackupTarget {
    db: Database,
    file: PathBuf,
}

/// Handle to the promotion task.
pub struct PromotionBatcher {
    tx: mpsc::UnboundedSender<Message>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PromotionBatcher {
    /// Spawns the batching task on the current runtime.
    pub fn spawn(store: Arc<CacheStore>, debounce: Duration) -> Self {
        Self::start(store, None, debounce)
    }

    /// Like [`spawn`](Self::spawn), also dumping stored records of `db` to
    /// `file` after each batch that promoted at least one record.
    pub fn spawn_with_backup(
        store: Arc<CacheStore>,
        debounce: Duration,
        db: Database,
        file: impl Into<PathBuf>,
    ) -> Self {
        let backup = BackupTarget {
            db,
            file: file.into(),
        };
        Self::start(store, Some(backup), debounce)
    }

    fn start(store: Arc<CacheStore>, backup: Option<BackupTarget>, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(store, backup, debounce, rx));
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queues `url` for promotion to `path_to` under the library root.
    ///
    /// A later entry for the same URL replaces the earlier one. Returns
    /// false once the batcher has shut down.
    pub fn queue(&self, url: impl Into<String>, path_to: impl Into<String>) -> bool {
        self.tx
            .send(Message::Queue {
                url: url.into(),
                path_to: path_to.into(),
            })
            .is_ok()
    }

    /// Promotes the pending batch now. Returns how many records moved.
    pub async fn flush(&self) -> usize {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Message::Flush(ack)).is_err() {
            return 0;
        }
        done.await.unwrap_or(0)
    }

    /// Flushes the pending batch and stops the task.
    pub async fn shutdown(&self) -> usize {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Message::Shutdown(ack)).is_err() {
            return 0;
        }
        let promoted = done.await.unwrap_or(0);

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        promoted
    }
}

async fn run(
    store: Arc<CacheStore>,
    backup: Option<BackupTarget>,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    let backup = backup.as_ref();
    let mut pending: HashMap<String, String> = HashMap::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let message = match deadline {
            Some(at) => tokio::select! {
                message = rx.recv() => message,
                _ = tokio::time::sleep_until(at) => {
                    deadline = None;
                    flush(&store, backup, &mut pending).await;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match message {
            Some(Message::Queue { url, path_to }) => {
                debug!("Queued {} for promotion to {}", url, path_to);
                pending.insert(url, path_to);
                deadline = Some(Instant::now() + debounce);
            }
            Some(Message::Flush(ack)) => {
                deadline = None;
                let _ = ack.send(flush(&store, backup, &mut pending).await);
            }
            Some(Message::Shutdown(ack)) => {
                let _ = ack.send(flush(&store, backup, &mut pending).await);
                break;
            }
            None => {
                flush(&store, backup, &mut pending).await;
                break;
            }
        }
    }
    debug!("Promotion task stopped");
}

async fn flush(
    store: &CacheStore,
    backup: Option<&BackupTarget>,
    pending: &mut HashMap<String, String>,
) -> usize {
    if pending.is_empty() {
        return 0;
    }
    let batch = std::mem::take(pending);
    let urls: Vec<String> = batch.keys().cloned().collect();

    let records = match store.persistence().lookup_by_urls(&urls) {
        Ok(records) => records,
        Err(e) => {
            warn!("Promotion batch of {} dropped: {}", batch.len(), e);
            return 0;
        }
    };

    let instructions: Vec<MoveInstruction> = records
        .iter()
        .filter_map(|record| {
            let path_to = batch.get(&record.url)?;
            if record.stored && &record.path == path_to {
                return None;
            }
            Some(MoveInstruction::promote(record, path_to.clone()))
        })
        .collect();

    let promoted = store.promote(&instructions).await.len();
    info!("Promotion batch flushed: {} of {} urls moved", promoted, batch.len());

    if let Some(target) = backup.filter(|_| promoted > 0) {
        if let Err(e) = backup::dump_stored(&target.db, &target.file) {
            warn!("Backup after promotion failed: {}", e);
        }
    }
    promoted
}
