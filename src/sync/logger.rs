//! Structured logging for the offer sync
//!
//! This module provides functionality for:
//! 1. Installing the global tracing subscriber (console plus daily log file)
//! 2. Logging store syncs and system events with a per-run id
//! 3. Writing logs in JSON or line format

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, fmt::format::FmtSpan, prelude::*};
use uuid::Uuid;

use super::config_loader::AppConfig;

const LOG_FILE_PREFIX: &str = "kruoka_sync.log";

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Log entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryType {
    StoreSync,
    System,
    Error,
}

impl std::fmt::Display for LogEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogEntryType::StoreSync => write!(f, "store_sync"),
            LogEntryType::System => write!(f, "system"),
            LogEntryType::Error => write!(f, "error"),
        }
    }
}

/// Status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Logger for structured logging
pub struct Logger {
    run_id: Uuid,
    log_dir: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

impl Logger {
    /// Create a new logger and install the global subscriber
    pub fn new(config: &AppConfig) -> LoggerResult<Self> {
        let logging = &config.logging;

        let log_dir = if logging.log_to_file {
            let dir = PathBuf::from(&config.paths.log_directory);
            std::fs::create_dir_all(&dir)?;
            Some(dir)
        } else {
            None
        };

        let guard = Self::init_logger(
            log_dir.as_deref(),
            logging.log_to_terminal,
            &logging.log_format,
            &logging.log_level,
        )?;

        Ok(Self {
            run_id: Uuid::new_v4(),
            log_dir,
            _guard: guard,
        })
    }

    /// Install console and file layers. Leaves an existing subscriber alone.
    fn init_logger(
        log_dir: Option<&Path>,
        to_terminal: bool,
        format: &str,
        level: &str,
    ) -> LoggerResult<Option<WorkerGuard>> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| LoggerError::Logging(e.to_string()))?;

        let json = format == "json";
        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

        if to_terminal {
            layers.push(fmt::layer().with_target(false).boxed());
        }

        let mut guard = None;
        if let Some(dir) = log_dir {
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(worker_guard);

            let file_layer = if json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed()
            };
            layers.push(file_layer);
        }

        match tracing_subscriber::registry().with(layers).with(filter).try_init() {
            Ok(()) => info!(log_format = format, log_level = level, "Logger initialized"),
            Err(e) => debug!("Tracing already initialized, keeping it: {}", e),
        }

        Ok(guard)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Directory of the daily log file, when file logging is on
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Log the outcome of one store's sync
    pub fn log_store_sync(&self, store_id: &str, status: OperationStatus, offers: Option<usize>) {
        info!(
            entry_type = %LogEntryType::StoreSync,
            run_id = %self.run_id,
            store_id = store_id,
            status = %status,
            offers = offers,
            timestamp = %Utc::now().to_rfc3339(),
            "Store sync {} for {}",
            status,
            store_id
        );
    }

    /// Log a system event
    pub fn log_system_event(&self, event_type: &str, details: &str) {
        info!(
            entry_type = %LogEntryType::System,
            run_id = %self.run_id,
            event_type = event_type,
            details = details,
            timestamp = %Utc::now().to_rfc3339(),
            "System event: {}",
            event_type
        );
    }

    /// Log an error
    pub fn log_error(&self, error_type: &str, message: &str) {
        error!(
            entry_type = %LogEntryType::Error,
            run_id = %self.run_id,
            error_type = error_type,
            timestamp = %Utc::now().to_rfc3339(),
            "Error: {}",
            message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_logger_creates_directory_and_tolerates_reinit() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.log_directory = dir.path().join("logs").to_string_lossy().into_owned();
        config.logging.log_to_terminal = false;

        let first = Logger::new(&config).unwrap();
        assert!(dir.path().join("logs").is_dir());
        first.log_system_event("test", "first logger");

        // A second install must not fail
        let second = Logger::new(&config).unwrap();
        assert_ne!(first.run_id(), second.run_id());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(LogEntryType::StoreSync.to_string(), "store_sync");
        assert_eq!(OperationStatus::Failed.to_string(), "failed");
    }
}
