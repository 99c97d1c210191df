//! recsync - synchronized multi-source recording from the command line
//!
//! Subcommands:
//! - `recsync start` - Launch the enabled capture sources together
//! - `recsync pause` / `recsync resume` - Split the session into parts
//! - `recsync stop` - End the session and merge its parts
//! - `recsync status` - Show the session as recorded in the state directory
//! - `recsync process <dir>` - (Re)run post-processing for a session

use anyhow::Result;
use clap::Parser;
use recsync::cli::Cli;
use recsync::config::Config;
use recsync::recorder::SessionController;
use recsync::{commands, logging};
use std::process::ExitCode;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path.clone())?,
        None => Config::load()?,
    };

    let _guard = logging::init_logging()?;
    tracing::debug!(
        "recsync v{} ({:?}), config {:?}",
        env!("CARGO_PKG_VERSION"),
        cli.command,
        config.config_path()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let controller = SessionController::from_config(config)?;
    let json = cli.command.json();

    let result = runtime.block_on(commands::dispatch(&controller, &cli.command));
    Ok(match result {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!("Command failed: {}", e);
            commands::report_error(&e, json);
            ExitCode::FAILURE
        }
    })
}
