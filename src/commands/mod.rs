//! Command handlers
//!
//! Maps parsed subcommands onto the session controller and prints errors in
//! the form the invocation asked for.

pub mod recording;

use crate::cli::Command;
use crate::recorder::SessionController;
use crate::utils::{AppError, AppResult, ErrorResponse};
use std::process::ExitCode;

/// Run one subcommand
pub async fn dispatch(controller: &SessionController, command: &Command) -> AppResult<ExitCode> {
    match command {
        Command::Start(args) => recording::start(controller, args).await,
        Command::Stop(args) => recording::stop(controller, args).await,
        Command::Pause => recording::pause(controller).await,
        Command::Resume => recording::resume(controller).await,
        Command::Status { json } => recording::status(controller, *json),
        Command::Process { dir, json } => recording::process(controller, dir, *json).await,
        Command::Config => show_config(controller),
    }
}

fn show_config(controller: &SessionController) -> AppResult<ExitCode> {
    let config = controller.config();
    if let Some(path) = config.config_path() {
        println!("# {}", path.display());
    }
    println!("{}", config.to_toml()?);
    Ok(ExitCode::SUCCESS)
}

/// Print a failed command's error. JSON goes to stdout so scripts read one stream.
pub fn report_error(error: &AppError, json: bool) {
    if json {
        let response = ErrorResponse::from(error);
        match serde_json::to_string_pretty(&response) {
            Ok(body) => println!("{}", body),
            Err(_) => eprintln!("Error: {}", error),
        }
        return;
    }

    for warning in error.warnings() {
        eprintln!("  {}", warning);
    }
    eprintln!("Error: {}", error);
}
