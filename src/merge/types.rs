//! Merge types
//!
//! Steps, progress events, options and errors of the post-processing pipeline.

use crate::capture::SourceKind;
use crate::config::ProcessingConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStep {
    /// Join each source's parts into one stream
    Concat,
    Denoise,
    /// Loudness measurement pass
    Analyze,
    Normalize,
    /// Mux sources into the final video
    Merge,
    /// Additional outputs built from the merged result
    Derive,
}

impl MergeStep {
    pub const ALL: [MergeStep; 6] = [
        MergeStep::Concat,
        MergeStep::Denoise,
        MergeStep::Analyze,
        MergeStep::Normalize,
        MergeStep::Merge,
        MergeStep::Derive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStep::Concat => "concat",
            MergeStep::Denoise => "denoise",
            MergeStep::Analyze => "analyze",
            MergeStep::Normalize => "normalize",
            MergeStep::Merge => "merge",
            MergeStep::Derive => "derive",
        }
    }
}

impl fmt::Display for MergeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a pipeline reports about a step through its step callback
#[derive(Debug, Clone, PartialEq)]
pub enum StepUpdate {
    Started,
    Completed,
    Skipped,
    Failed(String),
}

/// Kind of a relayed progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ProgressKind {
    Started,
    Progress { percent: f32 },
    Completed,
    Skipped,
    Failed { error: String },
}

/// One event of the uniform progress stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub step: MergeStep,
    #[serde(flatten)]
    pub kind: ProgressKind,
}

impl ProgressEvent {
    pub fn new(step: MergeStep, kind: ProgressKind) -> Self {
        Self { step, kind }
    }

    pub fn from_update(step: MergeStep, update: StepUpdate) -> Self {
        let kind = match update {
            StepUpdate::Started => ProgressKind::Started,
            StepUpdate::Completed => ProgressKind::Completed,
            StepUpdate::Skipped => ProgressKind::Skipped,
            StepUpdate::Failed(error) => ProgressKind::Failed { error },
        };
        Self::new(step, kind)
    }

    pub fn progress(step: MergeStep, percent: f32) -> Self {
        Self::new(
            step,
            ProgressKind::Progress {
                percent: percent.clamp(0.0, 100.0),
            },
        )
    }

    pub fn is_progress(&self) -> bool {
        matches!(self.kind, ProgressKind::Progress { .. })
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ProgressKind::Started => write!(f, "{}: started", self.step),
            ProgressKind::Progress { percent } => write!(f, "{}: {:.0}%", self.step, percent),
            ProgressKind::Completed => write!(f, "{}: done", self.step),
            ProgressKind::Skipped => write!(f, "{}: skipped", self.step),
            ProgressKind::Failed { error } => write!(f, "{}: failed: {}", self.step, error),
        }
    }
}

/// Post-processing choices recorded with a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOptions {
    pub denoise: bool,
    pub normalize: bool,
    pub loudness_target: f64,
    /// Overlay the camera stream onto the screen stream
    pub camera_overlay: bool,
    pub derive_audio: bool,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self::from(&ProcessingConfig::default())
    }
}

impl From<&ProcessingConfig> for ProcessingOptions {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            denoise: config.denoise,
            normalize: config.normalize,
            loudness_target: config.loudness_target,
            camera_overlay: config.camera_overlay,
            derive_audio: config.derive_audio,
        }
    }
}

/// Everything the pipeline needs to produce the final media
#[derive(Debug, Clone)]
pub struct MergeInput {
    /// Ordered parts per source
    pub parts: BTreeMap<SourceKind, Vec<PathBuf>>,
    pub output_dir: PathBuf,
    pub title: String,
    pub options: ProcessingOptions,
}

impl MergeInput {
    pub fn has_audio(&self) -> bool {
        self.parts
            .get(&SourceKind::Audio)
            .is_some_and(|p| !p.is_empty())
    }

    pub fn has_video(&self) -> bool {
        self.parts
            .iter()
            .any(|(kind, parts)| kind.has_video() && !parts.is_empty())
    }
}

/// Final paths produced by a successful run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutput {
    /// Merged video, or audio-only file when nothing was filmed
    pub merged: Option<PathBuf>,
    /// Audio-only export
    pub derived_audio: Option<PathBuf>,
}

/// Merge errors
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    #[error("Nothing to merge: no recorded parts")]
    NoInputs,

    #[error("Loudness analysis failed: {0}")]
    Analysis(String),

    #[error("Step {step} failed: {message}")]
    Step { step: MergeStep, message: String },

    #[error("Merge pipeline aborted: {0}")]
    Aborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_json_shape() {
        let event = ProgressEvent::progress(MergeStep::Normalize, 140.0);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["step"], "normalize");
        assert_eq!(json["type"], "progress");
        assert_eq!(json["percent"], 100.0);

        let failed = ProgressEvent::from_update(MergeStep::Merge, StepUpdate::Failed("boom".into()));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["error"], "boom");
        assert!(!failed.is_progress());
    }

    #[test]
    fn test_progress_classification() {
        assert!(!ProgressEvent::from_update(MergeStep::Concat, StepUpdate::Started).is_progress());
        assert!(ProgressEvent::progress(MergeStep::Merge, 10.0).is_progress());
    }
}
