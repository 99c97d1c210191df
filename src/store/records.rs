//! Key-addressed session records
//!
//! Each record is a single human-readable line in its own file. Writes go
//! through a temp file and a rename so a concurrent reader sees either the old
//! or the new value, never a torn one.

use super::process::{ProcessController, UnixProcessController};
use crate::capture::SourceKind;
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// State store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access state record {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Keys of the records that make up a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// PID of a running capture process
    Pid(SourceKind),
    /// File the capture process is writing for the current part
    OutputPath(SourceKind),
    /// When the session (not the part) started
    StartedAt,
    /// Part number the next launch writes to
    CurrentPart,
    /// Directory holding the session's parts and metadata
    OutputDir,
    /// Present while the session is paused
    PauseMarker,
    /// Output directory of a session whose merge is running
    Processing,
}

impl RecordKey {
    /// File name of the record inside the state directory
    pub fn file_name(&self) -> String {
        match self {
            RecordKey::Pid(kind) => format!("pid.{kind}"),
            RecordKey::OutputPath(kind) => format!("path.{kind}"),
            RecordKey::StartedAt => "session.started_at".to_string(),
            RecordKey::CurrentPart => "session.part".to_string(),
            RecordKey::OutputDir => "session.output_dir".to_string(),
            RecordKey::PauseMarker => "session.paused".to_string(),
            RecordKey::Processing => "session.processing".to_string(),
        }
    }

    /// Session-level keys, excluding per-source records and the processing marker
    pub const SESSION: [RecordKey; 4] = [
        RecordKey::StartedAt,
        RecordKey::CurrentPart,
        RecordKey::OutputDir,
        RecordKey::PauseMarker,
    ];
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Persisted facts about one active capture source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub kind: SourceKind,
    pub pid: u32,
    pub path: Option<PathBuf>,
}

/// Flat-file key/value store shared by every invocation
#[derive(Clone)]
pub struct StateStore {
    dir: PathBuf,
    processes: Arc<dyn ProcessController>,
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore").field("dir", &self.dir).finish()
    }
}

impl StateStore {
    /// Open (and create if needed) a store in `dir`
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::with_controller(dir, Arc::new(UnixProcessController))
    }

    /// Open a store that answers liveness questions through `processes`
    pub fn with_controller(
        dir: impl Into<PathBuf>,
        processes: Arc<dyn ProcessController>,
    ) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir, processes })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn processes(&self) -> Arc<dyn ProcessController> {
        self.processes.clone()
    }

    fn record_path(&self, key: RecordKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Overwrite a record. Last writer wins.
    pub fn write_record(&self, key: RecordKey, value: impl fmt::Display) -> StoreResult<()> {
        let path = self.record_path(key);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", key.file_name(), std::process::id()));

        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        fs::write(&tmp, format!("{value}\n")).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;

        tracing::trace!("Wrote state record {}", key);
        Ok(())
    }

    /// Read a record; a missing or blank record is `None`
    pub fn read_record(&self, key: RecordKey) -> StoreResult<Option<String>> {
        let path = self.record_path(key);
        match fs::read_to_string(&path) {
            Ok(content) => {
                let value = content.trim();
                Ok((!value.is_empty()).then(|| value.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// Delete a record. Deleting a missing record is fine.
    pub fn clear_record(&self, key: RecordKey) -> StoreResult<()> {
        let path = self.record_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    pub fn has_record(&self, key: RecordKey) -> StoreResult<bool> {
        Ok(self.read_record(key)?.is_some())
    }

    /// Read and parse a record, treating unparsable values as absent
    fn read_parsed<T: std::str::FromStr>(&self, key: RecordKey) -> StoreResult<Option<T>> {
        Ok(self.read_record(key)?.and_then(|raw| match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring malformed state record {}: {:?}", key, raw);
                None
            }
        }))
    }

    /// Recorded PID for a source. Values that can't be a capture process are absent.
    pub fn read_pid(&self, kind: SourceKind) -> StoreResult<Option<u32>> {
        Ok(self
            .read_parsed::<u32>(RecordKey::Pid(kind))?
            .filter(|pid| *pid > 1))
    }

    pub fn read_part(&self) -> StoreResult<Option<u32>> {
        self.read_parsed(RecordKey::CurrentPart)
    }

    pub fn read_started_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.read_parsed(RecordKey::StartedAt)
    }

    pub fn read_path(&self, key: RecordKey) -> StoreResult<Option<PathBuf>> {
        Ok(self.read_record(key)?.map(PathBuf::from))
    }

    /// Whether `pid` names a live, signalable process
    pub fn is_alive(&self, pid: u32) -> bool {
        self.processes.is_alive(pid)
    }

    /// Every source that currently has a PID record, in source order
    pub fn source_records(&self) -> StoreResult<Vec<SourceRecord>> {
        let mut records = Vec::new();
        for kind in SourceKind::ALL {
            if let Some(pid) = self.read_pid(kind)? {
                records.push(SourceRecord {
                    kind,
                    pid,
                    path: self.read_path(RecordKey::OutputPath(kind))?,
                });
            }
        }
        Ok(records)
    }

    pub fn write_source_record(&self, record: &SourceRecord) -> StoreResult<()> {
        if let Some(path) = &record.path {
            self.write_record(RecordKey::OutputPath(record.kind), path.display())?;
        }
        self.write_record(RecordKey::Pid(record.kind), record.pid)
    }

    pub fn clear_source_record(&self, kind: SourceKind) -> StoreResult<()> {
        self.clear_record(RecordKey::Pid(kind))?;
        self.clear_record(RecordKey::OutputPath(kind))
    }

    /// Remove every per-source and session-level record
    pub fn clear_session(&self) -> StoreResult<()> {
        for kind in SourceKind::ALL {
            self.clear_source_record(kind)?;
        }
        for key in RecordKey::SESSION {
            self.clear_record(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::process::{ProcessStatus, Signal};
    use tempfile::tempdir;

    struct NothingAlive;

    impl ProcessController for NothingAlive {
        fn check_process(&self, _pid: u32) -> io::Result<ProcessStatus> {
            Ok(ProcessStatus::NotFound)
        }

        fn send_signal(&self, _pid: u32, _signal: Signal) -> io::Result<()> {
            Ok(())
        }
    }

    fn store(dir: &Path) -> StateStore {
        StateStore::with_controller(dir, Arc::new(NothingAlive)).unwrap()
    }

    #[test]
    fn test_missing_record_is_absent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        assert_eq!(store.read_record(RecordKey::OutputDir).unwrap(), None);
        assert!(store.clear_record(RecordKey::OutputDir).is_ok());
        assert_eq!(store.read_pid(SourceKind::Camera).unwrap(), None);
    }

    #[test]
    fn test_write_overwrites_and_clear_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.write_record(RecordKey::CurrentPart, 0).unwrap();
        store.write_record(RecordKey::CurrentPart, 3).unwrap();
        assert_eq!(store.read_part().unwrap(), Some(3));

        // Human-readable on disk
        let raw = fs::read_to_string(dir.path().join("session.part")).unwrap();
        assert_eq!(raw, "3\n");

        store.clear_record(RecordKey::CurrentPart).unwrap();
        store.clear_record(RecordKey::CurrentPart).unwrap();
        assert_eq!(store.read_part().unwrap(), None);
    }

    #[test]
    fn test_malformed_values_are_absent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        fs::write(dir.path().join("pid.screen"), "not-a-pid").unwrap();
        fs::write(dir.path().join("pid.audio"), "0").unwrap();
        fs::write(dir.path().join("session.started_at"), "yesterday").unwrap();

        assert_eq!(store.read_pid(SourceKind::Screen).unwrap(), None);
        assert_eq!(store.read_pid(SourceKind::Audio).unwrap(), None);
        assert_eq!(store.read_started_at().unwrap(), None);
        assert!(store.source_records().unwrap().is_empty());
    }

    #[test]
    fn test_source_records_round_trip_through_files() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let record = SourceRecord {
            kind: SourceKind::Audio,
            pid: 4242,
            path: Some(PathBuf::from("/tmp/rec/audio_part000.wav")),
        };
        store.write_source_record(&record).unwrap();

        // A second store over the same directory sees the same record
        let other = self::store(dir.path());
        assert_eq!(other.source_records().unwrap(), vec![record]);

        other.clear_session().unwrap();
        assert!(store.source_records().unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_started_at_parses_rfc3339() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let now = Utc::now();

        store.write_record(RecordKey::StartedAt, now.to_rfc3339()).unwrap();
        assert_eq!(store.read_started_at().unwrap(), Some(now));
    }
}
