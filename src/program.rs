use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Error, bail};
use tracing::{error, info, trace, warn};

use crate::kruoka::{self, Aggregator, ApiClient, health};
use crate::sync::logger::OperationStatus;
use crate::sync::{AppConfig, Logger, Pipeline, SqliteStore, SyncSummary};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What a run does, chosen by the first command-line argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Full store and offer sync (default)
    Sync,
    /// Probe the API and report
    Health,
}

impl Mode {
    pub(crate) fn from_arg(arg: Option<&str>) -> Result<Self, Error> {
        match arg {
            None | Some("sync") => Ok(Mode::Sync),
            Some("health") => Ok(Mode::Health),
            Some(other) => bail!("Unknown command {other:?}, expected \"sync\" or \"health\""),
        }
    }
}

/// Drives one run of the batch job.
pub(crate) struct Program {
    config: AppConfig,
    logger: Logger,
}

impl Program {
    pub(crate) fn new(config: AppConfig, logger: Logger) -> Self {
        Self { config, logger }
    }

    /// Runs the selected mode. Failure exit codes are returned, not raised.
    pub(crate) fn run(&self, mode: Mode) -> Result<ExitCode, Error> {
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Run id: {}", self.logger.run_id());
        trace!("Log directory: {:?}", self.logger.log_dir());
        self.logger
            .log_system_event("start", &format!("{NAME} {VERSION} in {mode:?} mode"));

        let client = kruoka::init_api_client(&self.config);
        let code = match mode {
            Mode::Health => self.run_health(&client),
            Mode::Sync => self.run_sync(&client),
        };

        let limiter = client.transport().limiter().get_stats();
        let sessions = client.transport().pool().get_stats();
        info!(
            resolutions = sessions.resolutions,
            sessions_built = sessions.sessions_built,
            "{}",
            limiter.format_stats()
        );
        client.transport().pool().shutdown();

        if let Err(e) = &code {
            self.logger.log_error("run_failed", &format!("{e:#}"));
        }
        code
    }

    fn run_health(&self, client: &ApiClient) -> Result<ExitCode, Error> {
        let report = health::check(client);
        println!("{}", serde_json::to_string_pretty(&report)?);

        if report.ok {
            Ok(ExitCode::SUCCESS)
        } else {
            Ok(ExitCode::FAILURE)
        }
    }

    fn run_sync(&self, client: &ApiClient) -> Result<ExitCode, Error> {
        let store = SqliteStore::open(&self.config.paths.database_file)
            .with_context(|| format!("Failed to open database {}", self.config.paths.database_file))?;
        if !store.schema_ok()? {
            warn!("Database schema is missing tables or is out of date");
        }
        let pipeline = Pipeline::new(Aggregator::new(client.clone()), Arc::new(store));

        let summary = pipeline.run(&self.config.sync).context("Sync run failed")?;
        self.report(&summary);
        info!(
            stores = pipeline.store().count("stores")?,
            products = pipeline.store().count("products")?,
            offers = pipeline.store().count("offers")?,
            "Database totals"
        );

        if summary.exceeds_failure_threshold() {
            error!(
                failed = summary.failed_stores.len(),
                stores = summary.stores,
                "Too many stores failed, exiting with code 1"
            );
            return Ok(ExitCode::FAILURE);
        }
        Ok(ExitCode::SUCCESS)
    }

    fn report(&self, summary: &SyncSummary) {
        for report in &summary.reports {
            match &report.error {
                None => self
                    .logger
                    .log_store_sync(&report.store_id, OperationStatus::Completed, Some(report.offers)),
                Some(e) => {
                    self.logger
                        .log_store_sync(&report.store_id, OperationStatus::Failed, None);
                    self.logger.log_error("store_sync", e);
                }
            }
            if report.failed_partitions > 0 {
                warn!(
                    store_id = %report.store_id,
                    failed_partitions = report.failed_partitions,
                    "Some categories could not be fetched"
                );
            }
        }

        info!("{}", "=".repeat(60));
        info!("Sync complete");
        info!("  Stores synced : {}", summary.stores);
        info!("  Total offers  : {}", summary.total_offers);
        info!("  Errors        : {} {:?}", summary.failed_stores.len(), summary.failed_stores);
        info!(
            "  Elapsed       : {:.1} s ({:.1} min)",
            summary.elapsed_seconds,
            summary.elapsed_seconds / 60.0
        );
        info!("{}", "=".repeat(60));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_arg() {
        assert_eq!(Mode::from_arg(None).unwrap(), Mode::Sync);
        assert_eq!(Mode::from_arg(Some("health")).unwrap(), Mode::Health);
        assert!(Mode::from_arg(Some("--frobnicate")).is_err());
    }
}
