//! Recording command handlers
//!
//! Thin wrappers over `SessionController` that print results. Warnings go to
//! stderr, results to stdout.

use crate::cli::{StartArgs, StopArgs};
use crate::merge::{ProgressReceiver, ProgressRelay};
use crate::recorder::{
    ProcessingSummary, SessionController, SessionStatus, SourceWarning, StartReport, StopMode,
    StopOptions, StopReport, WarningLevel,
};
use crate::utils::{AppError, AppResult};
use serde::Serialize;
use std::path::Path;
use std::process::ExitCode;
use tokio::task::JoinHandle;

pub async fn start(controller: &SessionController, args: &StartArgs) -> AppResult<ExitCode> {
    let options = args.to_options(controller.config());
    let report = controller.start(options).await?;
    print_start(&report, "Recording");
    Ok(ExitCode::SUCCESS)
}

pub async fn pause(controller: &SessionController) -> AppResult<ExitCode> {
    let report = controller.pause().await?;
    print_warnings(&report.warnings);
    println!(
        "Paused ({} stopped), next part {}",
        join_kinds(&report.stopped),
        report.next_part
    );
    Ok(ExitCode::SUCCESS)
}

pub async fn resume(controller: &SessionController) -> AppResult<ExitCode> {
    let report = controller.resume().await?;
    print_start(&report, "Resumed");
    Ok(ExitCode::SUCCESS)
}

pub async fn stop(controller: &SessionController, args: &StopArgs) -> AppResult<ExitCode> {
    let mode = if args.no_process {
        StopMode::SkipProcessing
    } else if args.detach {
        StopMode::Handoff
    } else {
        StopMode::Blocking
    };

    let (relay, printer) = if mode == StopMode::Blocking && !args.json {
        let (relay, printer) = progress_printer(controller);
        (Some(relay), Some(printer))
    } else {
        (None, None)
    };

    let outcome = controller
        .stop(StopOptions {
            mode,
            progress: relay,
        })
        .await?;
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let mut report = outcome.report;
    if mode == StopMode::Handoff {
        if let Some(dir) = &report.output_dir {
            if let Err(e) = spawn_processor(controller, dir) {
                tracing::error!("Failed to launch background processing: {}", e);
                report.processing = ProcessingSummary::Failed {
                    error: format!("failed to launch background processing: {e}"),
                };
            }
        }
    }

    print_warnings(&report.warnings);
    if args.json {
        print_json(&report)?;
    } else {
        print_stop(&report);
    }

    Ok(match report.processing {
        ProcessingSummary::Failed { .. } => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

pub async fn process(controller: &SessionController, dir: &Path, json: bool) -> AppResult<ExitCode> {
    if !crate::metadata::is_session_dir(dir) {
        return Err(AppError::InvalidArgument(format!(
            "{:?} is not a recording directory",
            dir
        )));
    }

    let (relay, printer) = if json {
        (ProgressRelay::detached(), None)
    } else {
        let (relay, printer) = progress_printer(controller);
        (relay, Some(printer))
    };

    let result = controller.process(dir, relay).await;
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    let outputs = result?;

    if json {
        print_json(&outputs)?;
    } else {
        if let Some(merged) = &outputs.merged {
            println!("Merged: {}", merged.display());
        }
        if let Some(audio) = &outputs.derived_audio {
            println!("Audio: {}", audio.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn status(controller: &SessionController, json: bool) -> AppResult<ExitCode> {
    let status = controller.status()?;
    if json {
        print_json(&status)?;
    } else {
        print_status(&status);
    }
    Ok(ExitCode::SUCCESS)
}

/// Relay wired to a task that prints each event to stderr until the merge ends
fn progress_printer(controller: &SessionController) -> (ProgressRelay, JoinHandle<()>) {
    let (relay, mut receiver): (ProgressRelay, ProgressReceiver) =
        ProgressRelay::channel(controller.config().processing.relay_capacity);
    let printer = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            eprintln!("  {}", event);
        }
    });
    (relay, printer)
}

/// Run `recsync process <dir>` in its own process group so it outlives us
fn spawn_processor(controller: &SessionController, dir: &Path) -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    if let Some(config) = controller.config().config_path() {
        command.arg("--config").arg(config);
    }
    command
        .arg("process")
        .arg(dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command.spawn()?;
    tracing::info!("Processing {:?} in background (pid {})", dir, child.id());
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_warnings(warnings: &[SourceWarning]) {
    for warning in warnings {
        match warning.level {
            WarningLevel::Warning => eprintln!("warning: {}", warning),
            WarningLevel::Error => eprintln!("error: {}", warning),
        }
    }
}

fn print_start(report: &StartReport, verb: &str) {
    print_warnings(&report.warnings);
    println!(
        "{} {} into {} (part {})",
        verb,
        join_kinds(&report.started),
        report.output_dir.display(),
        report.part
    );
}

fn print_stop(report: &StopReport) {
    println!("Stopped {}", join_kinds(&report.stopped));
    if let Some(dir) = &report.output_dir {
        println!("Session: {}", dir.display());
    }
    match &report.processing {
        ProcessingSummary::Skipped => println!("Processing skipped"),
        ProcessingSummary::Pending | ProcessingSummary::Running => {
            println!("Processing in background")
        }
        ProcessingSummary::Completed { outputs } => {
            if let Some(merged) = &outputs.merged {
                println!("Merged: {}", merged.display());
            }
            if let Some(audio) = &outputs.derived_audio {
                println!("Audio: {}", audio.display());
            }
        }
        ProcessingSummary::Failed { error } => eprintln!("Processing failed: {}", error),
    }
}

fn print_status(status: &SessionStatus) {
    println!("State: {}", status.state);
    if let Some(part) = status.part {
        println!("Part: {}", part);
    }
    if let Some(dir) = &status.output_dir {
        println!("Session: {}", dir.display());
    }
    if let Some(elapsed) = status.elapsed() {
        let secs = elapsed.num_seconds().max(0);
        println!(
            "Elapsed: {:02}:{:02}:{:02}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        );
    }
    for source in &status.sources {
        let liveness = if source.alive { "running" } else { "exited" };
        match &source.path {
            Some(path) => println!(
                "  {:<7} pid {:<7} {:<8} {}",
                source.kind.as_str(),
                source.pid,
                liveness,
                path.display()
            ),
            None => println!(
                "  {:<7} pid {:<7} {}",
                source.kind.as_str(),
                source.pid,
                liveness
            ),
        }
    }
    if !status.crashed_sources.is_empty() {
        eprintln!(
            "warning: {} exited unexpectedly; stop or start again to clean up",
            join_kinds(&status.crashed_sources)
        );
    }
    if let Some(dir) = &status.processing_dir {
        println!("Processing: {}", dir.display());
    }
}

fn join_kinds(kinds: &[crate::capture::SourceKind]) -> String {
    if kinds.is_empty() {
        return "no sources".to_string();
    }
    kinds
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SourceKind;

    #[test]
    fn test_join_kinds() {
        assert_eq!(join_kinds(&[]), "no sources");
        assert_eq!(
            join_kinds(&[SourceKind::Screen, SourceKind::Audio]),
            "screen, audio"
        );
    }
}
