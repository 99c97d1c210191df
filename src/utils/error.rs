//! Error types and handling
//!
//! Application-level error shared by the command handlers, and its JSON form.

use crate::recorder::{RecordingError, SourceWarning};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl AppError {
    /// Stable code for scripts reading `--json` output
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Recording(e) => match e {
                RecordingError::AlreadyRecording => "ALREADY_RECORDING",
                RecordingError::NotRecording => "NOT_RECORDING",
                RecordingError::AlreadyPaused => "ALREADY_PAUSED",
                RecordingError::NotPaused => "NOT_PAUSED",
                RecordingError::NoSourcesEnabled => "NO_SOURCES_ENABLED",
                RecordingError::NoSourcesStarted(_) => "NO_SOURCES_STARTED",
                RecordingError::PrimarySourceFailed { .. } => "SCREEN_FAILED",
                RecordingError::InconsistentState(_) => "INCONSISTENT_STATE",
                RecordingError::Store(_) => "STATE_STORE_ERROR",
                RecordingError::Metadata(_) => "METADATA_ERROR",
                RecordingError::Merge(_) => "PROCESSING_ERROR",
                RecordingError::Io(_) => "IO_ERROR",
            },
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::InvalidArgument(_) => "INVALID_ARGUMENT",
        }
    }

    /// Per-source failures behind the error, if any
    pub fn warnings(&self) -> &[SourceWarning] {
        match self {
            AppError::Recording(e) => e.warnings(),
            _ => &[],
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Config(format!("{error:#}"))
    }
}

/// Error response printed for `--json`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SourceWarning>,
}

impl From<&AppError> for ErrorResponse {
    fn from(error: &AppError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
            warnings: error.warnings().to_vec(),
        }
    }
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        ErrorResponse::from(&error)
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SourceKind;

    #[test]
    fn test_precondition_codes() {
        assert_eq!(
            AppError::from(RecordingError::AlreadyRecording).code(),
            "ALREADY_RECORDING"
        );
        assert_eq!(AppError::from(RecordingError::NotPaused).code(), "NOT_PAUSED");
    }

    #[test]
    fn test_response_carries_start_warnings() {
        let error = AppError::from(RecordingError::NoSourcesStarted(vec![SourceWarning::new(
            SourceKind::Camera,
            "device busy",
        )]));
        let response = ErrorResponse::from(error);

        assert_eq!(response.code, "NO_SOURCES_STARTED");
        assert_eq!(response.message, "No recording sources started");
        assert_eq!(response.warnings.len(), 1);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["warnings"][0]["kind"], "camera");
    }

    #[test]
    fn test_response_omits_empty_warnings() {
        let response = ErrorResponse::from(AppError::InvalidArgument("x".into()));
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("warnings").is_none());
    }
}
