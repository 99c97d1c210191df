//! Recording metadata schema
//!
//! The `recording.json` document kept in every session directory. Its status
//! mirrors the session state machine and is rewritten on every transition.

use crate::capture::{SourceKind, SourceSettings};
use crate::merge::{MergeOutput, ProcessingOptions};
use crate::recorder::state::RecordingState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Choices made when the session started
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSettings {
    pub sources: Vec<SourceSettings>,
    #[serde(default)]
    pub processing: ProcessingOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
    pub version: String,
    pub id: Uuid,
    pub title: String,
    pub status: RecordingState,
    pub settings: RecordingSettings,

    /// Part files per source, in recording order
    #[serde(default)]
    pub parts: BTreeMap<SourceKind, Vec<PathBuf>>,

    #[serde(default)]
    pub outputs: MergeOutput,

    #[serde(default)]
    pub errors: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub pause_count: u32,
}

impl RecordingMetadata {
    /// A fresh document for a session that is starting now
    pub fn new(title: impl Into<String>, settings: RecordingSettings) -> Self {
        let now = Utc::now();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            id: Uuid::new_v4(),
            title: title.into(),
            status: RecordingState::Recording,
            settings,
            parts: BTreeMap::new(),
            outputs: MergeOutput::default(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            stopped_at: None,
            completed_at: None,
            pause_count: 0,
        }
    }

    /// Move to `status`, stamping the matching timestamps.
    ///
    /// Transitions the state machine doesn't allow are applied anyway but logged.
    pub fn set_status(&mut self, status: RecordingState) {
        if self.status != status && !self.status.can_transition_to(status) {
            tracing::warn!(
                "Recording {} moving from {} to {} outside the normal lifecycle",
                self.id,
                self.status,
                status
            );
        }

        let now = Utc::now();
        match status {
            RecordingState::Paused => self.pause_count += 1,
            RecordingState::Processing => self.stopped_at = Some(now),
            RecordingState::Completed | RecordingState::Failed => {
                self.stopped_at.get_or_insert(now);
                self.completed_at = Some(now);
            }
            _ => {}
        }
        self.status = status;
        self.updated_at = now;
    }

    pub fn push_part(&mut self, kind: SourceKind, path: PathBuf) {
        let parts = self.parts.entry(kind).or_default();
        if !parts.contains(&path) {
            parts.push(path);
        }
        self.updated_at = Utc::now();
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> RecordingMetadata {
        RecordingMetadata::new(
            "Demo",
            RecordingSettings {
                sources: vec![
                    SourceSettings::new(SourceKind::Screen),
                    SourceSettings::new(SourceKind::Audio).with_device(Some("hw:1".into())),
                ],
                processing: ProcessingOptions::default(),
            },
        )
    }

    #[test]
    fn test_status_timestamps() {
        let mut meta = metadata();
        assert_eq!(meta.status, RecordingState::Recording);

        meta.set_status(RecordingState::Paused);
        meta.set_status(RecordingState::Recording);
        assert_eq!(meta.pause_count, 1);

        meta.set_status(RecordingState::Processing);
        assert!(meta.stopped_at.is_some());
        assert!(meta.completed_at.is_none());

        meta.set_status(RecordingState::Completed);
        assert!(meta.completed_at.is_some());
    }

    #[test]
    fn test_parts_keep_order_without_duplicates() {
        let mut meta = metadata();
        meta.push_part(SourceKind::Screen, PathBuf::from("screen_part000.mkv"));
        meta.push_part(SourceKind::Screen, PathBuf::from("screen_part001.mkv"));
        meta.push_part(SourceKind::Screen, PathBuf::from("screen_part001.mkv"));
        meta.push_part(SourceKind::Audio, PathBuf::from("audio_part000.wav"));

        assert_eq!(meta.parts[&SourceKind::Screen].len(), 2);
        assert_eq!(meta.parts[&SourceKind::Audio].len(), 1);
    }

    #[test]
    fn test_json_uses_source_names_as_keys() {
        let mut meta = metadata();
        meta.push_part(SourceKind::Camera, PathBuf::from("camera_part000.mkv"));
        let json = serde_json::to_value(&meta).unwrap();

        assert_eq!(json["status"], "recording");
        assert_eq!(json["parts"]["camera"][0], "camera_part000.mkv");
        assert_eq!(json["pauseCount"], 0);
        assert!(json["createdAt"].is_string());
    }
}
