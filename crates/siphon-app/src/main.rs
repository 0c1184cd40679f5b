//! Siphon - cache inspection and maintenance.
//!
//! The interception engine runs embedded in the host application; this
//! binary works on the same data directory to look at what was captured,
//! revalidate or promote individual records and manage backups.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

/// Siphon - inspect and maintain the interception cache
#[derive(Parser, Debug)]
#[command(name = "siphon", version, about)]
struct Args {
    /// Data directory (database, cache and library)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Print the record cached for a URL
    Lookup { url: String },
    /// List records in permanent storage
    Stored,
    /// Revalidate a cached record with its origin
    Revalidate { url: String },
    /// Move a cached record into the library
    Promote {
        url: String,
        /// Destination relative to the library directory
        path: String,
    },
    /// Write promoted records to a JSON backup
    Backup { file: Option<PathBuf> },
    /// Restore promoted records into an empty database
    Restore { file: Option<PathBuf> },
    /// Print the effective engine configuration
    Config,
}

/// Default data directory.
fn default_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "siphon", "siphon").map(|dirs| dirs.data_dir().to_path_buf())
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args, data_dir: &std::path::Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("siphon={},warn", log_level)));

    let log_dir = data_dir.join("logs");
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(5)
            .filename_prefix("siphon")
            .filename_suffix("log")
            .build(&log_dir)
            .ok();

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            // Console gets output only when debugging; stdout carries results.
            if args.debug {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
            }

            tracing::debug!("Logging to {:?}", log_dir);
            return Some(guard);
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let data_dir = match args.data_dir.clone().or_else(default_data_dir) {
        Some(dir) => dir,
        None => anyhow::bail!("Could not determine a data directory; pass --data-dir"),
    };
    let _log_guard = init_logging(&args, &data_dir);

    let ctx = commands::Context::open(&data_dir)?;
    commands::run(&ctx, args.command).await
}
