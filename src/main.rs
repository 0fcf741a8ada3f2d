use std::env::consts::{ARCH, FAMILY, OS};
use std::process::ExitCode;

use anyhow::{Context, Error};
use tracing::trace;

use crate::program::{Mode, Program};
use crate::sync::{ConfigManager, Logger};

mod kruoka;
mod program;
mod sync;

/// Directory holding `config.toml`, overridable for scheduled runs.
const CONFIG_DIR_VAR: &str = "KRUOKA_CONFIG_DIR";

fn main() -> Result<ExitCode, Error> {
    let mode = Mode::from_arg(std::env::args().nth(1).as_deref())?;

    let config_dir = std::env::var(CONFIG_DIR_VAR).unwrap_or_else(|_| ".".to_string());
    let config = ConfigManager::new(&config_dir)
        .with_context(|| format!("Failed to load configuration from {config_dir}"))?
        .get_app_config()
        .clone();

    // Held until exit so buffered log lines reach the file
    let logger = Logger::new(&config).context("Failed to initialize logging")?;
    log_system_information();

    let program = Program::new(config, logger);
    program.run(mode)
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}
