//! Batch-job side of the sync
//! Configuration, logging, record mapping, persistence and the per-store pipeline

pub mod config_loader;
pub mod database;
pub mod logger;
pub mod mapper;
pub mod pipeline;

pub use config_loader::{AppConfig, ConfigManager};
pub use database::{SqliteStore, Store};
pub use logger::Logger;
pub use pipeline::{Pipeline, StoreSyncReport, SyncSummary};
