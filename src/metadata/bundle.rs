//! Recording metadata read/write operations
//!
//! A session directory holds the part files of every source and a
//! `recording.json` document describing them.

use super::schema::RecordingMetadata;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the metadata document inside a session directory
pub const METADATA_FILE: &str = "recording.json";

/// Metadata-related errors
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not a session directory: {0:?}")]
    InvalidDir(PathBuf),

    #[error("Missing recording.json in {0:?}")]
    MissingFile(PathBuf),
}

pub fn metadata_path(session_dir: &Path) -> PathBuf {
    session_dir.join(METADATA_FILE)
}

/// Read the metadata document of a session directory
pub fn read_metadata(session_dir: &Path) -> Result<RecordingMetadata, MetadataError> {
    if !session_dir.is_dir() {
        return Err(MetadataError::InvalidDir(session_dir.to_path_buf()));
    }

    let path = metadata_path(session_dir);
    if !path.exists() {
        return Err(MetadataError::MissingFile(session_dir.to_path_buf()));
    }

    let content = fs::read_to_string(&path)?;
    let metadata: RecordingMetadata = serde_json::from_str(&content)?;

    tracing::debug!("Loaded recording '{}' from {:?}", metadata.title, session_dir);

    Ok(metadata)
}

/// Write the metadata document, replacing any previous one atomically
pub fn write_metadata(
    metadata: &RecordingMetadata,
    session_dir: &Path,
) -> Result<(), MetadataError> {
    fs::create_dir_all(session_dir)?;

    let content = serde_json::to_string_pretty(metadata)?;
    let tmp = session_dir.join(format!(".{}.{}.tmp", METADATA_FILE, std::process::id()));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, metadata_path(session_dir))?;

    tracing::debug!(
        "Saved recording '{}' ({}) to {:?}",
        metadata.title,
        metadata.status,
        session_dir
    );

    Ok(())
}

/// Load, modify and save the metadata document in one go
pub fn update_metadata<F>(session_dir: &Path, f: F) -> Result<RecordingMetadata, MetadataError>
where
    F: FnOnce(&mut RecordingMetadata),
{
    let mut metadata = read_metadata(session_dir)?;
    f(&mut metadata);
    write_metadata(&metadata, session_dir)?;
    Ok(metadata)
}

/// Check if a path is a session directory
pub fn is_session_dir(path: &Path) -> bool {
    path.is_dir() && metadata_path(path).is_file()
}
