//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use siphon_core::{EngineConfig, Headers};
use siphon_intercept::{Revalidator, Validator};
use siphon_storage::{backup, CacheStore, Database, MoveInstruction, StorageRoots};

use crate::Command;

/// Open storage for one invocation.
pub struct Context {
    pub db: Database,
    pub store: CacheStore,
    pub config: EngineConfig,
    pub backup_file: PathBuf,
}

impl Context {
    /// Opens the database under `data_dir`, restoring promoted records from
    /// the backup if the database is new.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = Database::with_path(data_dir.join("siphon.db"))
            .with_context(|| format!("opening database in {}", data_dir.display()))?;
        let backup_file = data_dir.join("backup").join("paths.json");

        let restored = backup::restore_if_empty(&db, &backup_file)?;
        if restored > 0 {
            tracing::info!("Restored {} records from backup", restored);
        }

        let config = db.engine_config()?;
        let store = CacheStore::new(Arc::new(db.clone()), StorageRoots::under(data_dir));
        Ok(Self {
            db,
            store,
            config,
            backup_file,
        })
    }
}

pub async fn run(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Lookup { url } => {
            let record = ctx
                .store
                .lookup(&url)
                .await?
                .ok_or_else(|| anyhow!("{} is not cached", url))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            println!("file: {}", ctx.store.resolve_path(&record).display());
        }
        Command::Stored => {
            for record in ctx.db.all_stored()? {
                println!("{}\t{}", record.url, record.path);
            }
        }
        Command::Revalidate { url } => {
            let record = ctx
                .store
                .lookup(&url)
                .await?
                .ok_or_else(|| anyhow!("{} is not cached", url))?;
            let revalidator = Revalidator::new(ctx.config.user_agent.clone())?;
            let result = revalidator
                .revalidate("GET", &record, &record.info.sent_headers)
                .await;

            if !result.accepted {
                anyhow::bail!("origin did not answer for {}", url);
            }
            println!("status: {:?}", result.status_code);
            for header in result.response_headers.as_ref().unwrap_or(&Headers::new()) {
                println!("{}: {}", header.name, header.value);
            }
            if let Some(body) = &result.body {
                println!("body: {} bytes", body.len());
            }
        }
        Command::Promote { url, path } => {
            let record = ctx
                .store
                .lookup(&url)
                .await?
                .ok_or_else(|| anyhow!("{} is not cached", url))?;
            let moved = ctx
                .store
                .move_record(&MoveInstruction::promote(&record, path))
                .await?;
            println!("{}", ctx.store.resolve_path(&moved).display());

            // Keep the backup in step with the library.
            backup::dump_stored(&ctx.db, &ctx.backup_file)?;
        }
        Command::Backup { file } => {
            let file = file.unwrap_or_else(|| ctx.backup_file.clone());
            let count = backup::dump_stored(&ctx.db, &file)?;
            println!("{} records written to {}", count, file.display());
        }
        Command::Restore { file } => {
            let file = file.unwrap_or_else(|| ctx.backup_file.clone());
            let count = backup::restore_if_empty(&ctx.db, &file)?;
            println!("{} records restored", count);
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&ctx.config)?);
        }
    }
    Ok(())
}
