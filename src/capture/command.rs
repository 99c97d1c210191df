//! Capture sources backed by external commands
//!
//! Each source kind launches its own tool from a configured argument
//! template. The tool runs in its own process group with stdin detached so it
//! outlives the invocation that started it, and it is stopped with SIGINT so it
//! can finalize its output file.

use super::traits::{
    CaptureError, CaptureResult, CaptureSource, SourceHandle, SourceHealth, SourceKind,
};
use crate::config::{RecordingConfig, SourceCommand};
use crate::store::{ProcessController, ProcessStatus, Signal};
use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const OUTPUT_PLACEHOLDER: &str = "{output}";
const DEVICE_PLACEHOLDER: &str = "{device}";

/// Timing knobs shared by launch and terminate
#[derive(Debug, Clone, Copy)]
pub struct ProcessTiming {
    /// How long a new process must stay up to count as started
    pub settle: Duration,
    /// How often to re-check liveness while waiting for exit
    pub poll_interval: Duration,
    /// How long to wait for exit after SIGKILL
    pub kill_timeout: Duration,
}

impl From<&RecordingConfig> for ProcessTiming {
    fn from(config: &RecordingConfig) -> Self {
        Self {
            settle: config.launch_settle(),
            poll_interval: config.poll_interval(),
            kill_timeout: config.kill_timeout(),
        }
    }
}

impl Default for ProcessTiming {
    fn default() -> Self {
        Self::from(&RecordingConfig::default())
    }
}

/// A capture source that runs an external command
pub struct CommandSource {
    kind: SourceKind,
    command: SourceCommand,
    processes: Arc<dyn ProcessController>,
    timing: ProcessTiming,
}

impl CommandSource {
    pub fn new(
        kind: SourceKind,
        command: SourceCommand,
        processes: Arc<dyn ProcessController>,
        timing: ProcessTiming,
    ) -> Self {
        Self {
            kind,
            command,
            processes,
            timing,
        }
    }

    /// Wait until `pid` is gone or `timeout` elapses. Returns whether it exited.
    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.processes.check_process(pid) {
                Ok(ProcessStatus::NotFound) => return true,
                Ok(_) => {}
                Err(e) => tracing::debug!("Liveness check for pid {} failed: {}", pid, e),
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.timing.poll_interval).await;
        }
    }

    fn signal(&self, pid: u32, signal: Signal) -> CaptureResult<()> {
        self.processes
            .send_signal(pid, signal)
            .map_err(|source| CaptureError::Signal {
                kind: self.kind,
                pid,
                source,
            })
    }
}

/// Substitute `{output}` and `{device}` into an argument template
pub fn expand_template(template: &[String], output: &Path, device: &str) -> Vec<String> {
    let output = output.to_string_lossy();
    template
        .iter()
        .map(|arg| {
            arg.replace(OUTPUT_PLACEHOLDER, &output)
                .replace(DEVICE_PLACEHOLDER, device)
        })
        .collect()
}

/// Side file collecting the capture tool's stderr
fn stderr_log_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".log");
    target.with_file_name(name)
}

#[async_trait]
impl CaptureSource for CommandSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn extension(&self) -> &str {
        &self.command.extension
    }

    fn prepare(&self, target_path: &Path, device: Option<&str>) -> CaptureResult<SourceHandle> {
        if self.command.command.is_empty() {
            return Err(CaptureError::MissingCommand(self.kind));
        }

        if let Some(parent) = target_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CaptureError::OutputDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let device = device
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.command.device)
            .to_string();
        let argv = expand_template(&self.command.command, target_path, &device);

        tracing::debug!("Prepared {} capture: {:?}", self.kind, argv);

        Ok(SourceHandle {
            kind: self.kind,
            target_path: target_path.to_path_buf(),
            device,
            argv,
            pid: None,
            health: SourceHealth::Prepared,
        })
    }

    async fn launch(&self, handle: &mut SourceHandle) -> CaptureResult<u32> {
        let (program, args) = handle
            .argv
            .split_first()
            .ok_or(CaptureError::MissingCommand(self.kind))?;

        let stderr = match File::create(stderr_log_path(&handle.target_path)) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                tracing::warn!("No stderr log for {} capture: {}", self.kind, e);
                Stdio::null()
            }
        };

        let spawned = {
            let mut command = Command::new(program);
            command
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(stderr);

            // Keep terminal Ctrl+C in the controlling shell away from the capture tool
            #[cfg(unix)]
            {
                use std::os::unix::process::CommandExt;
                command.process_group(0);
            }

            command.spawn()
        };

        let mut child = spawned.map_err(|source| {
            handle.health = SourceHealth::Failed;
            CaptureError::Spawn {
                kind: self.kind,
                source,
            }
        })?;
        let pid = child.id();

        // A tool that can't open its device usually dies right away
        if !self.timing.settle.is_zero() {
            tokio::time::sleep(self.timing.settle).await;
        }
        match child.try_wait() {
            Ok(Some(status)) => {
                handle.health = SourceHealth::Failed;
                return Err(CaptureError::ExitedEarly {
                    kind: self.kind,
                    status: status.to_string(),
                });
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("Could not poll {} capture pid {}: {}", self.kind, pid, e),
        }

        handle.pid = Some(pid);
        handle.health = SourceHealth::Running;
        tracing::info!(
            "{} capture started (pid {}) -> {:?}",
            self.kind,
            pid,
            handle.target_path
        );
        Ok(pid)
    }

    async fn terminate(&self, handle: &mut SourceHandle, grace: Duration) -> CaptureResult<()> {
        let pid = handle.pid.ok_or(CaptureError::NotLaunched(self.kind))?;

        if !self.processes.is_alive(pid) {
            handle.health = SourceHealth::Exited;
            return Ok(());
        }

        self.signal(pid, Signal::Interrupt)?;
        if self.wait_for_exit(pid, grace).await {
            tracing::info!("{} capture (pid {}) stopped", self.kind, pid);
            handle.health = SourceHealth::Exited;
            return Ok(());
        }

        tracing::warn!(
            "{} capture (pid {}) ignored SIGINT for {:?}, killing",
            self.kind,
            pid,
            grace
        );
        self.signal(pid, Signal::Kill)?;
        if self.wait_for_exit(pid, self.timing.kill_timeout).await {
            handle.health = SourceHealth::Exited;
            return Ok(());
        }

        Err(CaptureError::Unkillable {
            kind: self.kind,
            pid,
        })
    }
}
