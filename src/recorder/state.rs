//! Recording state management
//!
//! Defines the session state machine and the status report derived from
//! persisted records.

use crate::capture::{SourceKind, SourceSettings};
use crate::merge::ProcessingOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// State of the recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No session
    #[default]
    Idle,
    Recording,
    Paused,
    /// Sources stopped, merge running
    Processing,
    Completed,
    Failed,
    /// Source records exist but none of their processes is alive
    Crashed,
}

impl RecordingState {
    /// A session exists and owns the capture sources
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RecordingState::Recording | RecordingState::Paused | RecordingState::Crashed
        )
    }

    /// Whether the machine may move from `self` to `next`
    pub fn can_transition_to(&self, next: RecordingState) -> bool {
        use RecordingState::*;
        matches!(
            (*self, next),
            (Idle | Completed | Failed, Recording)
                | (Crashed, Recording)
                | (Recording, Paused)
                | (Paused, Recording)
                | (Recording | Paused | Crashed, Processing)
                | (Recording | Paused | Crashed, Completed)
                | (Processing, Completed | Failed)
                | (Completed | Failed, Processing)
                | (Recording | Paused, Failed)
                | (Recording, Crashed)
                | (Completed | Failed | Crashed, Idle)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingState::Idle => "idle",
            RecordingState::Recording => "recording",
            RecordingState::Paused => "paused",
            RecordingState::Processing => "processing",
            RecordingState::Completed => "completed",
            RecordingState::Failed => "failed",
            RecordingState::Crashed => "crashed",
        }
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a new session should record and how to process it afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    pub sources: Vec<SourceSettings>,

    /// Session directory; a timestamped directory under the output root when unset
    pub output_dir: Option<PathBuf>,

    pub title: Option<String>,

    pub processing: ProcessingOptions,
}

impl StartOptions {
    pub fn new(sources: Vec<SourceSettings>) -> Self {
        Self {
            sources,
            output_dir: None,
            title: None,
            processing: ProcessingOptions::default(),
        }
    }
}

/// One recorded source as seen by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub kind: SourceKind,
    pub pid: u32,
    pub alive: bool,
    pub path: Option<PathBuf>,
}

/// Session status derived from persisted records only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: RecordingState,
    /// Mirrors `state` for scripts reading `status --json`
    #[serde(rename = "isRecording")]
    pub recording: bool,
    #[serde(rename = "isPaused")]
    pub paused: bool,
    pub part: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub output_dir: Option<PathBuf>,
    pub sources: Vec<SourceStatus>,
    /// Sources with a PID record whose process is gone
    pub crashed_sources: Vec<SourceKind>,
    /// Session directory whose merge is still running
    pub processing_dir: Option<PathBuf>,
}

impl SessionStatus {
    pub fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }

    pub fn is_paused(&self) -> bool {
        self.state == RecordingState::Paused
    }

    /// Time since the session started, if it did
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.started_at.map(|t| Utc::now() - t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use RecordingState::*;
        let path = [Idle, Recording, Paused, Recording, Processing, Completed, Idle];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        use RecordingState::*;
        assert!(!Idle.can_transition_to(Paused));
        assert!(!Idle.can_transition_to(Processing));
        assert!(!Paused.can_transition_to(Paused));
        assert!(!Processing.can_transition_to(Recording));
        assert!(!Completed.can_transition_to(Paused));
    }

    #[test]
    fn test_status_serializes_lowercase_state() {
        let status = SessionStatus {
            state: RecordingState::Paused,
            paused: true,
            part: Some(1),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "paused");
        assert_eq!(json["isPaused"], true);
        assert_eq!(json["isRecording"], false);
        assert_eq!(json["part"], 1);
        assert!(status.is_paused());
    }
}
