//! Database repositories for each table.

pub mod config;
pub mod paths;

pub use config::ConfigRepo;
pub use paths::PathsRepo;
