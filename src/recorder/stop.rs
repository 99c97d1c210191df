//! Teardown of active capture sources
//!
//! Used by stop and pause, and by start to undo a partial launch. Every
//! source is signalled at once so the slowest one bounds the whole teardown.

use super::error::{RecordingResult, SourceWarning};
use crate::capture::{SourceHandle, SourceKind, SourceRegistry};
use crate::store::StateStore;
use std::time::Duration;
use tokio::task::JoinSet;

/// Result of tearing down a set of sources
#[derive(Debug, Default)]
pub struct TeardownOutcome {
    /// Sources that exited (or were already gone)
    pub stopped: Vec<SourceKind>,
    pub warnings: Vec<SourceWarning>,
}

#[derive(Debug, Clone)]
pub struct TeardownCoordinator {
    registry: SourceRegistry,
    store: StateStore,
    grace: Duration,
}

impl TeardownCoordinator {
    pub fn new(registry: SourceRegistry, store: StateStore, grace: Duration) -> Self {
        Self {
            registry,
            store,
            grace,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Terminate every source that has a record, then clear those records
    pub async fn teardown(&self) -> RecordingResult<TeardownOutcome> {
        let records = self.store.source_records()?;
        if records.is_empty() {
            tracing::debug!("No capture sources to tear down");
            return Ok(TeardownOutcome::default());
        }

        let handles = records.iter().map(SourceHandle::from_record).collect();
        let outcome = self.terminate_handles(handles).await;

        for record in &records {
            self.store.clear_source_record(record.kind)?;
        }
        Ok(outcome)
    }

    /// Terminate launched handles concurrently. Failures become warnings.
    pub async fn terminate_handles(&self, handles: Vec<SourceHandle>) -> TeardownOutcome {
        let mut outcome = TeardownOutcome::default();
        let mut tasks = JoinSet::new();

        for mut handle in handles {
            let Some(source) = self.registry.get(handle.kind) else {
                outcome.warnings.push(SourceWarning::new(
                    handle.kind,
                    format!("no capture source configured to stop pid {:?}", handle.pid),
                ));
                continue;
            };
            let grace = self.grace;
            tasks.spawn(async move {
                let result = source.terminate(&mut handle, grace).await;
                (handle.kind, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, Ok(()))) => outcome.stopped.push(kind),
                Ok((kind, Err(e))) => {
                    tracing::warn!("Failed to stop {} capture: {}", kind, e);
                    outcome.warnings.push(SourceWarning::from_capture(kind, &e));
                }
                Err(e) => tracing::error!("Teardown task failed: {}", e),
            }
        }

        outcome.stopped.sort();
        outcome
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::capture::{CaptureSource, CommandSource, ProcessTiming};
    use crate::config::SourceCommand;
    use crate::store::{ProcessController, SourceRecord, UnixProcessController};
    use std::process::{Command, Stdio};
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::tempdir;

    fn registry() -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        for kind in SourceKind::ALL {
            registry.insert(Arc::new(CommandSource::new(
                kind,
                SourceCommand {
                    command: vec!["true".to_string()],
                    device: String::new(),
                    extension: "raw".to_string(),
                },
                Arc::new(UnixProcessController),
                ProcessTiming {
                    settle: Duration::ZERO,
                    poll_interval: Duration::from_millis(10),
                    kill_timeout: Duration::from_secs(1),
                },
            )));
        }
        registry
    }

    fn spawn(script: &str) -> u32 {
        Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::null())
            .spawn()
            .unwrap()
            .id()
    }

    #[tokio::test]
    async fn test_concurrent_teardown_within_grace_bound() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let pids = [
            (SourceKind::Screen, spawn("exec sleep 30")),
            (SourceKind::Audio, spawn("exec sleep 30")),
            (SourceKind::Camera, spawn("trap '' INT; exec sleep 30")),
        ];
        for (kind, pid) in pids {
            store
                .write_source_record(&SourceRecord {
                    kind,
                    pid,
                    path: None,
                })
                .unwrap();
        }

        let grace = Duration::from_millis(300);
        let coordinator = TeardownCoordinator::new(registry(), store.clone(), grace);

        let started = Instant::now();
        let outcome = coordinator.teardown().await.unwrap();

        // One stubborn source costs one grace period, not one per source
        assert!(started.elapsed() < grace * 2 + Duration::from_secs(1));
        assert_eq!(outcome.stopped, SourceKind::ALL.to_vec());
        assert!(outcome.warnings.is_empty());
        for (_, pid) in pids {
            assert!(!UnixProcessController.is_alive(pid));
        }
        assert!(store.source_records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_of_dead_records_just_clears_them() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        store
            .write_source_record(&SourceRecord {
                kind: SourceKind::Audio,
                pid,
                path: None,
            })
            .unwrap();

        let coordinator =
            TeardownCoordinator::new(registry(), store.clone(), Duration::from_millis(100));
        let outcome = coordinator.teardown().await.unwrap();

        assert_eq!(outcome.stopped, vec![SourceKind::Audio]);
        assert!(store.source_records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_unlaunched_handle_is_a_warning() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let coordinator = TeardownCoordinator::new(registry(), store, Duration::from_millis(100));

        let source = registry().get(SourceKind::Camera).unwrap();
        let handle = source.prepare(&dir.path().join("c.raw"), None).unwrap();
        let outcome = coordinator.terminate_handles(vec![handle]).await;

        assert!(outcome.stopped.is_empty());
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].kind, SourceKind::Camera);
    }
}
