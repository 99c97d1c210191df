//! Capture trait definitions
//!
//! Source-agnostic types shared by every capture source.

use crate::store::SourceRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Kind of capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Screen,
    Audio,
    Camera,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Screen, SourceKind::Audio, SourceKind::Camera];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Screen => "screen",
            SourceKind::Audio => "audio",
            SourceKind::Camera => "camera",
        }
    }

    /// The screen stream is the primary artifact of a session
    pub fn is_primary(&self) -> bool {
        matches!(self, SourceKind::Screen)
    }

    pub fn has_video(&self) -> bool {
        matches!(self, SourceKind::Screen | SourceKind::Camera)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "screen" => Ok(SourceKind::Screen),
            "audio" | "mic" | "microphone" => Ok(SourceKind::Audio),
            "camera" | "webcam" => Ok(SourceKind::Camera),
            other => Err(format!("unknown capture source: {other}")),
        }
    }
}

/// Per-source choices made when the session started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSettings {
    pub kind: SourceKind,

    /// Device selector handed to the capture tool (None = configured default)
    #[serde(default)]
    pub device: Option<String>,
}

impl SourceSettings {
    pub fn new(kind: SourceKind) -> Self {
        Self { kind, device: None }
    }

    pub fn with_device(mut self, device: Option<String>) -> Self {
        self.device = device;
        self
    }
}

/// Where a source's process is in its lifecycle, as far as this invocation knows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceHealth {
    /// Launch configuration built, nothing started
    #[default]
    Prepared,
    Running,
    /// Exited, whether asked to or not
    Exited,
    /// Launch failed
    Failed,
}

/// Launch configuration and process handle of one capture source
#[derive(Debug, Clone)]
pub struct SourceHandle {
    pub kind: SourceKind,

    /// File the capture process writes
    pub target_path: PathBuf,

    /// Resolved device selector
    pub device: String,

    /// Full command line, program first
    pub argv: Vec<String>,

    /// Process id once launched
    pub pid: Option<u32>,

    pub health: SourceHealth,
}

impl SourceHandle {
    /// Rebuild a handle for a process launched by another invocation
    pub fn from_record(record: &SourceRecord) -> Self {
        Self {
            kind: record.kind,
            target_path: record.path.clone().unwrap_or_default(),
            device: String::new(),
            argv: Vec::new(),
            pid: Some(record.pid),
            health: SourceHealth::Running,
        }
    }

    /// Persistable record for a launched handle
    pub fn to_record(&self) -> Option<SourceRecord> {
        self.pid.map(|pid| SourceRecord {
            kind: self.kind,
            pid,
            path: Some(self.target_path.clone()),
        })
    }
}

/// Capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No capture command configured for {0}")]
    MissingCommand(SourceKind),

    #[error("Failed to create output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch {kind} capture: {source}")]
    Spawn {
        kind: SourceKind,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} capture exited during startup ({status})")]
    ExitedEarly { kind: SourceKind, status: String },

    #[error("{0} capture has not been launched")]
    NotLaunched(SourceKind),

    #[error("Failed to signal {kind} capture (pid {pid}): {source}")]
    Signal {
        kind: SourceKind,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} capture (pid {pid}) did not exit after SIGINT/SIGKILL")]
    Unkillable { kind: SourceKind, pid: u32 },
}

pub type CaptureResult<T> = Result<T, CaptureError>;

/// Uniform lifecycle of one external capture process.
///
/// Implementations never touch the session state store; persisting what they
/// started is the coordinators' job.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// File extension of the parts this source produces
    fn extension(&self) -> &str;

    /// Build the launch configuration without starting anything
    fn prepare(&self, target_path: &Path, device: Option<&str>) -> CaptureResult<SourceHandle>;

    /// Start the external process and return its pid
    async fn launch(&self, handle: &mut SourceHandle) -> CaptureResult<u32>;

    /// Interrupt the process, escalating to a kill once `grace` runs out.
    /// A process that is already gone is not an error.
    async fn terminate(&self, handle: &mut SourceHandle, grace: Duration) -> CaptureResult<()>;
}

/// Path of a source's file for a given part, e.g. `screen_part001.mkv`
pub fn part_path(output_dir: &Path, kind: SourceKind, part: u32, extension: &str) -> PathBuf {
    output_dir.join(format!("{kind}_part{part:03}.{extension}"))
}
