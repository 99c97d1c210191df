//! Recording errors and per-source warnings

use crate::capture::{CaptureError, SourceKind};
use crate::merge::MergeError;
use crate::metadata::MetadataError;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// How bad a source problem is for the session as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    Warning,
    /// The session goes on without its primary source
    Error,
}

/// A single source failing to start or stop. Never fatal on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceWarning {
    pub kind: SourceKind,
    pub level: WarningLevel,
    pub message: String,
}

impl SourceWarning {
    pub fn new(kind: SourceKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            level: WarningLevel::Warning,
            message: message.into(),
        }
    }

    pub fn from_capture(kind: SourceKind, error: &CaptureError) -> Self {
        Self::new(kind, error.to_string())
    }

    pub fn escalate(mut self) -> Self {
        self.level = WarningLevel::Error;
        self
    }
}

impl fmt::Display for SourceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Recording errors
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("A recording session is already active")]
    AlreadyRecording,

    #[error("No recording session is active")]
    NotRecording,

    #[error("Recording is already paused")]
    AlreadyPaused,

    #[error("Recording is not paused")]
    NotPaused,

    #[error("No recording sources enabled")]
    NoSourcesEnabled,

    #[error("No recording sources started")]
    NoSourcesStarted(Vec<SourceWarning>),

    #[error("Screen capture failed to start: {reason}")]
    PrimarySourceFailed {
        reason: String,
        warnings: Vec<SourceWarning>,
    },

    #[error("Session state is incomplete: {0}")]
    InconsistentState(String),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecordingError {
    /// Per-source details attached to a failed start
    pub fn warnings(&self) -> &[SourceWarning] {
        match self {
            RecordingError::NoSourcesStarted(warnings) => warnings,
            RecordingError::PrimarySourceFailed { warnings, .. } => warnings,
            _ => &[],
        }
    }
}

pub type RecordingResult<T> = Result<T, RecordingError>;
