//! Per-session recording metadata

pub mod bundle;
pub mod schema;

pub use bundle::{
    is_session_dir, metadata_path, read_metadata, update_metadata, write_metadata, MetadataError,
    METADATA_FILE,
};
pub use schema::{RecordingMetadata, RecordingSettings};
