//! Siphon Storage - SQLite persistence and cache body placement.
//!
//! - [`Database`]: records table plus the configuration vault
//! - [`CacheStore`]: body files under the cache and library roots
//! - [`backup`]: JSON backup of promoted records

pub mod backup;
pub mod cache_store;
pub mod database;
pub mod error;
pub mod models;
pub mod persistence;
pub mod repository;
pub mod schema;

pub use cache_store::{storage_key, CacheStore, StorageRoots};
pub use database::Database;
pub use error::{Result, StorageError};
pub use models::{CacheRecord, Config, MoveInstruction};
pub use persistence::CachePersistence;
pub use repository::{ConfigRepo, PathsRepo};
