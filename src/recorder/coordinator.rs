//! Session controller
//!
//! Drives the recording lifecycle (start, pause, resume, stop, process) on top
//! of the persisted session records. Nothing is kept in memory between calls:
//! a controller built in another process over the same state directory sees
//! and controls the same session.

use super::error::{RecordingError, RecordingResult, SourceWarning};
use super::start::{StartCoordinator, StartOutcome, StartRequest};
use super::state::{RecordingState, SessionStatus, SourceStatus, StartOptions};
use super::stop::TeardownCoordinator;
use crate::capture::{SourceKind, SourceRegistry, SourceSettings};
use crate::config::Config;
use crate::merge::{
    FfmpegMergePipeline, MergeError, MergeInput, MergeOutput, MergePipeline, MergeStep,
    ProgressRelay, StepUpdate,
};
use crate::metadata::{self, RecordingMetadata, RecordingSettings};
use crate::store::{RecordKey, StateStore};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Events emitted during the session lifecycle
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    Started { output_dir: PathBuf, part: u32 },
    Paused { part: u32 },
    Resumed { part: u32 },
    Stopped { output_dir: PathBuf },
    /// A source failed without failing the session
    Warning(SourceWarning),
    ProcessingStarted { output_dir: PathBuf },
    Completed { output_dir: PathBuf },
    Failed { output_dir: PathBuf, error: String },
}

/// Result of a successful start or resume
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReport {
    pub output_dir: PathBuf,
    pub part: u32,
    pub started: Vec<SourceKind>,
    pub warnings: Vec<SourceWarning>,
}

/// Result of a pause
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseReport {
    /// Part the next resume records into
    pub next_part: u32,
    pub stopped: Vec<SourceKind>,
    pub warnings: Vec<SourceWarning>,
}

/// What `stop` does with the recorded parts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopMode {
    /// Run the merge before returning
    #[default]
    Blocking,
    /// Run the merge on a spawned task
    Detached,
    /// Mark the session processing and leave the merge to the caller
    Handoff,
    /// No merge; the raw parts are the result
    SkipProcessing,
}

#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    pub mode: StopMode,
    /// Listener for merge progress; events are discarded when unset
    pub progress: Option<ProgressRelay>,
}

/// What happened to post-processing as part of a stop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum ProcessingSummary {
    Skipped,
    /// Marked processing, merge left to another process
    Pending,
    /// Merge running on a background task
    Running,
    Completed { outputs: MergeOutput },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub output_dir: Option<PathBuf>,
    pub stopped: Vec<SourceKind>,
    pub warnings: Vec<SourceWarning>,
    pub processing: ProcessingSummary,
}

/// Result of a stop, with the background merge when one was spawned
#[derive(Debug)]
pub struct StopOutcome {
    pub report: StopReport,
    pub merge_task: Option<JoinHandle<RecordingResult<MergeOutput>>>,
}

/// Coordinates a recording session across independent invocations
#[derive(Clone)]
pub struct SessionController {
    config: Arc<Config>,
    store: StateStore,
    starter: StartCoordinator,
    teardown: TeardownCoordinator,
    pipeline: Arc<dyn MergePipeline>,
    event_tx: broadcast::Sender<RecordingEvent>,
}

impl SessionController {
    /// Create a controller over an existing store
    pub fn new(
        config: Config,
        store: StateStore,
        registry: SourceRegistry,
        pipeline: Arc<dyn MergePipeline>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let teardown = TeardownCoordinator::new(
            registry.clone(),
            store.clone(),
            config.recording.stop_grace(),
        );
        let starter = StartCoordinator::new(
            registry,
            store.clone(),
            teardown.clone(),
            config.recording.start_timeout(),
            config.recording.require_screen,
        );
        Self {
            config: Arc::new(config),
            store,
            starter,
            teardown,
            pipeline,
            event_tx,
        }
    }

    /// Controller with the configured state directory, command sources and
    /// the ffmpeg merge pipeline
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let store = StateStore::open(config.state_dir()?)?;
        let registry = SourceRegistry::from_config(&config, store.processes());
        let pipeline = Arc::new(FfmpegMergePipeline::from_config(&config.processing));
        Ok(Self::new(config, store, registry, pipeline))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: RecordingEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_warnings(&self, warnings: &[SourceWarning]) {
        for warning in warnings {
            self.emit(RecordingEvent::Warning(warning.clone()));
        }
    }

    /// Current status, derived from the state records alone
    pub fn status(&self) -> RecordingResult<SessionStatus> {
        let sources: Vec<SourceStatus> = self
            .store
            .source_records()?
            .into_iter()
            .map(|record| SourceStatus {
                kind: record.kind,
                pid: record.pid,
                alive: self.store.is_alive(record.pid),
                path: record.path,
            })
            .collect();
        let paused = self.store.has_record(RecordKey::PauseMarker)?;
        let processing_dir = self.store.read_path(RecordKey::Processing)?;

        let state = if paused {
            RecordingState::Paused
        } else if sources.iter().any(|s| s.alive) {
            RecordingState::Recording
        } else if !sources.is_empty() {
            RecordingState::Crashed
        } else if processing_dir.is_some() {
            RecordingState::Processing
        } else {
            RecordingState::Idle
        };

        let crashed_sources = sources.iter().filter(|s| !s.alive).map(|s| s.kind).collect();

        Ok(SessionStatus {
            state,
            recording: state == RecordingState::Recording,
            paused: state == RecordingState::Paused,
            part: self.store.read_part()?,
            started_at: self.store.read_started_at()?,
            output_dir: self.store.read_path(RecordKey::OutputDir)?,
            sources,
            crashed_sources,
            processing_dir,
        })
    }

    pub fn is_recording(&self) -> RecordingResult<bool> {
        Ok(self.status()?.is_recording())
    }

    pub fn is_paused(&self) -> RecordingResult<bool> {
        Ok(self.status()?.is_paused())
    }

    /// Start a new session
    pub async fn start(&self, options: StartOptions) -> RecordingResult<StartReport> {
        let status = self.status()?;
        match status.state {
            RecordingState::Recording | RecordingState::Paused => {
                return Err(RecordingError::AlreadyRecording)
            }
            RecordingState::Crashed => {
                tracing::warn!(
                    "Clearing stale session records (sources {:?} are no longer running)",
                    status.crashed_sources
                );
                self.teardown.teardown().await?;
                self.store.clear_session()?;
            }
            _ => {}
        }

        let sources = dedup_sources(&options.sources);
        if sources.is_empty() {
            return Err(RecordingError::NoSourcesEnabled);
        }

        let now = Local::now();
        let output_dir = options.output_dir.clone().unwrap_or_else(|| {
            self.config
                .output_root()
                .join(now.format("%Y%m%d-%H%M%S").to_string())
        });
        std::fs::create_dir_all(&output_dir)?;
        let title = options
            .title
            .clone()
            .unwrap_or_else(|| format!("Recording {}", now.format("%Y-%m-%d %H:%M")));

        tracing::info!("Starting recording '{}' in {:?}", title, output_dir);

        let mut metadata = RecordingMetadata::new(
            title,
            RecordingSettings {
                sources: sources.clone(),
                processing: options.processing.clone(),
            },
        );

        let request = StartRequest {
            output_dir: output_dir.clone(),
            part: 0,
            sources,
        };
        let outcome = match self.starter.start(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                for warning in e.warnings() {
                    metadata.push_error(warning.to_string());
                }
                metadata.push_error(e.to_string());
                metadata.set_status(RecordingState::Failed);
                if let Err(write_err) = metadata::write_metadata(&metadata, &output_dir) {
                    tracing::warn!("Failed to record start failure: {}", write_err);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.persist_session(&output_dir, &metadata, &outcome) {
            tracing::error!("Failed to persist new session, stopping sources: {}", e);
            self.teardown.teardown().await?;
            self.store.clear_session()?;
            return Err(e);
        }

        self.emit_warnings(&outcome.warnings);
        self.emit(RecordingEvent::Started {
            output_dir: output_dir.clone(),
            part: 0,
        });

        Ok(StartReport {
            output_dir,
            part: 0,
            started: outcome.kinds(),
            warnings: outcome.warnings,
        })
    }

    fn persist_session(
        &self,
        output_dir: &Path,
        metadata: &RecordingMetadata,
        outcome: &StartOutcome,
    ) -> RecordingResult<()> {
        self.store
            .write_record(RecordKey::StartedAt, Utc::now().to_rfc3339())?;
        self.store.write_record(RecordKey::CurrentPart, 0)?;
        self.store
            .write_record(RecordKey::OutputDir, output_dir.display())?;

        let mut metadata = metadata.clone();
        record_part(&mut metadata, outcome);
        metadata::write_metadata(&metadata, output_dir)?;
        Ok(())
    }

    /// Stop the sources and keep the session open for a later resume
    pub async fn pause(&self) -> RecordingResult<PauseReport> {
        match self.status()?.state {
            RecordingState::Paused => return Err(RecordingError::AlreadyPaused),
            RecordingState::Recording => {}
            _ => return Err(RecordingError::NotRecording),
        }

        let next_part = self.store.read_part()?.unwrap_or(0) + 1;

        // The marker goes down first so the session never looks idle mid-pause
        self.store
            .write_record(RecordKey::PauseMarker, Utc::now().to_rfc3339())?;
        self.store.write_record(RecordKey::CurrentPart, next_part)?;

        tracing::info!("Pausing recording, next part {}", next_part);
        let teardown = self.teardown.teardown().await?;

        if let Some(dir) = self.store.read_path(RecordKey::OutputDir)? {
            self.update_metadata(&dir, |m| {
                m.set_status(RecordingState::Paused);
                for warning in &teardown.warnings {
                    m.push_error(warning.to_string());
                }
            });
        }

        self.emit_warnings(&teardown.warnings);
        self.emit(RecordingEvent::Paused { part: next_part });

        Ok(PauseReport {
            next_part,
            stopped: teardown.stopped,
            warnings: teardown.warnings,
        })
    }

    /// Continue a paused session into its next part
    pub async fn resume(&self) -> RecordingResult<StartReport> {
        match self.status()?.state {
            RecordingState::Paused => {}
            RecordingState::Recording | RecordingState::Crashed => {
                return Err(RecordingError::NotPaused)
            }
            _ => return Err(RecordingError::NotRecording),
        }

        let output_dir = self.store.read_path(RecordKey::OutputDir)?.ok_or_else(|| {
            RecordingError::InconsistentState("paused session has no output directory".into())
        })?;
        let part = self.store.read_part()?.unwrap_or(0);

        let sources = match metadata::read_metadata(&output_dir) {
            Ok(metadata) => metadata.settings.sources,
            Err(e) => {
                tracing::warn!("No usable metadata for {:?} ({}), using default sources", output_dir, e);
                self.config
                    .recording
                    .default_sources
                    .iter()
                    .map(|k| SourceSettings::new(*k))
                    .collect()
            }
        };

        tracing::info!("Resuming recording into part {}", part);

        // The pause marker stays until the new part is running, so a failed
        // resume leaves the session paused
        let request = StartRequest {
            output_dir: output_dir.clone(),
            part,
            sources,
        };
        let outcome = self.starter.start(&request).await?;
        self.store.clear_record(RecordKey::PauseMarker)?;

        self.update_metadata(&output_dir, |m| {
            m.set_status(RecordingState::Recording);
            record_part(m, &outcome);
        });

        self.emit_warnings(&outcome.warnings);
        self.emit(RecordingEvent::Resumed { part });

        Ok(StartReport {
            output_dir,
            part,
            started: outcome.kinds(),
            warnings: outcome.warnings,
        })
    }

    /// End the session and hand its parts to the merge pipeline
    pub async fn stop(&self, options: StopOptions) -> RecordingResult<StopOutcome> {
        let status = self.status()?;
        if !status.state.is_active() {
            return Err(RecordingError::NotRecording);
        }
        if status.state == RecordingState::Crashed {
            tracing::warn!(
                "Stopping a session whose sources exited on their own: {:?}",
                status.crashed_sources
            );
        }

        tracing::info!("Stopping recording");
        let teardown = self.teardown.teardown().await?;
        let output_dir = self.store.read_path(RecordKey::OutputDir)?;
        self.store.clear_session()?;

        self.emit_warnings(&teardown.warnings);

        let mut report = StopReport {
            output_dir: output_dir.clone(),
            stopped: teardown.stopped,
            warnings: teardown.warnings,
            processing: ProcessingSummary::Skipped,
        };

        let Some(dir) = output_dir else {
            tracing::warn!("Session had no output directory, nothing to process");
            return Ok(StopOutcome {
                report,
                merge_task: None,
            });
        };

        self.emit(RecordingEvent::Stopped {
            output_dir: dir.clone(),
        });

        let warnings = report.warnings.clone();
        let next_status = if options.mode == StopMode::SkipProcessing {
            RecordingState::Completed
        } else {
            RecordingState::Processing
        };
        self.update_metadata(&dir, |m| {
            for warning in &warnings {
                m.push_error(warning.to_string());
            }
            m.set_status(next_status);
        });

        if options.mode == StopMode::SkipProcessing {
            tracing::info!("Skipping post-processing for {:?}", dir);
            self.emit(RecordingEvent::Completed { output_dir: dir });
            return Ok(StopOutcome {
                report,
                merge_task: None,
            });
        }

        self.store.write_record(RecordKey::Processing, dir.display())?;
        let relay = options.progress.unwrap_or_else(ProgressRelay::detached);

        let merge_task = match options.mode {
            StopMode::Blocking => {
                report.processing = match self.process(&dir, relay).await {
                    Ok(outputs) => ProcessingSummary::Completed { outputs },
                    Err(e) => ProcessingSummary::Failed {
                        error: e.to_string(),
                    },
                };
                None
            }
            StopMode::Detached => {
                report.processing = ProcessingSummary::Running;
                let controller = self.clone();
                Some(tokio::spawn(async move {
                    controller.process(&dir, relay).await
                }))
            }
            StopMode::Handoff | StopMode::SkipProcessing => {
                report.processing = ProcessingSummary::Pending;
                None
            }
        };

        Ok(StopOutcome { report, merge_task })
    }

    /// Run the merge pipeline over a stopped session's parts.
    ///
    /// Works on any session directory with a metadata document, so it can run
    /// in a different process than the one that stopped the session.
    pub async fn process(&self, output_dir: &Path, relay: ProgressRelay) -> RecordingResult<MergeOutput> {
        self.emit(RecordingEvent::ProcessingStarted {
            output_dir: output_dir.to_path_buf(),
        });

        let result = self.run_pipeline(output_dir, &relay).await;
        relay.finish();
        if relay.dropped() > 0 {
            tracing::debug!("{} progress updates dropped for a slow listener", relay.dropped());
        }

        match &result {
            Ok(outputs) => {
                tracing::info!("Processing complete for {:?}", output_dir);
                self.update_metadata(output_dir, |m| {
                    m.outputs = outputs.clone();
                    m.set_status(RecordingState::Completed);
                });
                self.emit(RecordingEvent::Completed {
                    output_dir: output_dir.to_path_buf(),
                });
            }
            Err(e) => {
                tracing::error!("Processing failed for {:?}: {}", output_dir, e);
                self.update_metadata(output_dir, |m| {
                    m.push_error(e.to_string());
                    m.set_status(RecordingState::Failed);
                });
                self.emit(RecordingEvent::Failed {
                    output_dir: output_dir.to_path_buf(),
                    error: e.to_string(),
                });
            }
        }

        // The marker goes whatever happened, so a failed merge never blocks a new session
        if let Err(e) = self.clear_processing_marker(output_dir) {
            tracing::warn!("Failed to clear processing marker for {:?}: {}", output_dir, e);
            if result.is_ok() {
                return Err(e);
            }
        }
        result
    }

    /// Load the session's parts and run the pipeline on a blocking thread
    async fn run_pipeline(
        &self,
        output_dir: &Path,
        relay: &ProgressRelay,
    ) -> RecordingResult<MergeOutput> {
        let metadata = metadata::read_metadata(output_dir)?;

        if metadata.status != RecordingState::Processing {
            tracing::info!(
                "Reprocessing {:?} (status was {})",
                output_dir,
                metadata.status
            );
            self.update_metadata(output_dir, |m| m.set_status(RecordingState::Processing));
            self.store
                .write_record(RecordKey::Processing, output_dir.display())?;
        }

        let input = MergeInput {
            parts: metadata.parts,
            output_dir: output_dir.to_path_buf(),
            title: metadata.title,
            options: metadata.settings.processing,
        };

        let pipeline = self.pipeline.clone();
        let publisher = relay.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let on_step = |step: MergeStep, update: StepUpdate| publisher.step(step, update);
            let on_percent = |step: MergeStep, percent: f32| publisher.percent(step, percent);
            pipeline.run(&input, &on_step, Some(&on_percent))
        })
        .await;

        match joined {
            Ok(result) => Ok(result?),
            Err(e) => Err(MergeError::Aborted(e.to_string()).into()),
        }
    }

    /// Drop the processing marker if it still names `output_dir`
    fn clear_processing_marker(&self, output_dir: &Path) -> RecordingResult<()> {
        if self.store.read_path(RecordKey::Processing)?.as_deref() == Some(output_dir) {
            self.store.clear_record(RecordKey::Processing)?;
        }
        Ok(())
    }

    /// Best-effort metadata update; the state records stay authoritative
    fn update_metadata<F>(&self, output_dir: &Path, f: F)
    where
        F: FnOnce(&mut RecordingMetadata),
    {
        if let Err(e) = metadata::update_metadata(output_dir, f) {
            tracing::warn!("Failed to update metadata in {:?}: {}", output_dir, e);
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("store", &self.store)
            .finish()
    }
}

/// First settings per kind, in source order
fn dedup_sources(sources: &[SourceSettings]) -> Vec<SourceSettings> {
    let mut seen = std::collections::BTreeMap::new();
    for settings in sources {
        seen.entry(settings.kind).or_insert_with(|| settings.clone());
    }
    seen.into_values().collect()
}

/// Append the files of a freshly started part
fn record_part(metadata: &mut RecordingMetadata, outcome: &StartOutcome) {
    for handle in &outcome.started {
        metadata.push_part(handle.kind, handle.target_path.clone());
    }
    for warning in &outcome.warnings {
        metadata.push_error(warning.to_string());
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::merge::ProgressKind;
    use crate::store::Signal;
    use tempfile::{tempdir, TempDir};

    struct FakePipeline {
        fail: bool,
    }

    impl MergePipeline for FakePipeline {
        fn run(
            &self,
            input: &MergeInput,
            on_step: &dyn Fn(MergeStep, StepUpdate),
            on_percent: Option<&dyn Fn(MergeStep, f32)>,
        ) -> Result<MergeOutput, MergeError> {
            for step in MergeStep::ALL {
                on_step(step, StepUpdate::Started);
                if step == MergeStep::Merge {
                    if let Some(on_percent) = on_percent {
                        on_percent(step, 50.0);
                    }
                    if self.fail {
                        on_step(step, StepUpdate::Failed("encoder exploded".into()));
                        return Err(MergeError::Ffmpeg("encoder exploded".into()));
                    }
                }
                on_step(step, StepUpdate::Completed);
            }
            Ok(MergeOutput {
                merged: Some(input.output_dir.join("merged.mp4")),
                derived_audio: None,
            })
        }
    }

    struct PanickingPipeline;

    impl MergePipeline for PanickingPipeline {
        fn run(
            &self,
            _input: &MergeInput,
            on_step: &dyn Fn(MergeStep, StepUpdate),
            _on_percent: Option<&dyn Fn(MergeStep, f32)>,
        ) -> Result<MergeOutput, MergeError> {
            on_step(MergeStep::Concat, StepUpdate::Started);
            panic!("pipeline bug");
        }
    }

    struct Env {
        state: TempDir,
        out: TempDir,
    }

    impl Env {
        fn new() -> Self {
            Self {
                state: tempdir().unwrap(),
                out: tempdir().unwrap(),
            }
        }

        fn config(&self, camera: &[&str]) -> Config {
            let mut config = Config::default();
            config.recording.output_root = Some(self.out.path().to_path_buf());
            config.recording.launch_settle_ms = 50;
            config.recording.stop_grace_ms = 500;
            config.recording.start_timeout_ms = 2000;
            config.recording.poll_interval_ms = 10;
            for kind in SourceKind::ALL {
                let source = config.sources.get_mut(kind);
                source.command = vec!["sleep".into(), "30".into()];
                source.extension = "raw".into();
            }
            config.sources.camera.command = camera.iter().map(|s| s.to_string()).collect();
            config
        }

        fn controller_with(&self, camera: &[&str], fail_merge: bool) -> SessionController {
            self.controller_with_pipeline(camera, Arc::new(FakePipeline { fail: fail_merge }))
        }

        fn controller_with_pipeline(
            &self,
            camera: &[&str],
            pipeline: Arc<dyn MergePipeline>,
        ) -> SessionController {
            let config = self.config(camera);
            let store = StateStore::open(self.state.path()).unwrap();
            let registry = SourceRegistry::from_config(&config, store.processes());
            SessionController::new(config, store, registry, pipeline)
        }

        fn controller(&self) -> SessionController {
            self.controller_with(&["sleep", "30"], false)
        }
    }

    fn options(kinds: &[SourceKind]) -> StartOptions {
        StartOptions::new(kinds.iter().map(|k| SourceSettings::new(*k)).collect())
    }

    fn blocking() -> StopOptions {
        StopOptions::default()
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let env = Env::new();
        let controller = env.controller();
        assert!(!controller.is_recording().unwrap());

        let report = controller
            .start(options(&[SourceKind::Screen, SourceKind::Audio]))
            .await
            .unwrap();
        assert_eq!(report.part, 0);
        assert_eq!(report.started, vec![SourceKind::Screen, SourceKind::Audio]);
        assert!(controller.is_recording().unwrap());

        // A second controller over the same records sees the same session
        let other = env.controller();
        let status = other.status().unwrap();
        assert_eq!(status.state, RecordingState::Recording);
        assert_eq!(status.part, Some(0));
        assert_eq!(status.output_dir.as_deref(), Some(report.output_dir.as_path()));
        assert!(status.started_at.is_some());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["isRecording"], true);
        assert_eq!(json["isPaused"], false);

        let (relay, mut rx) = ProgressRelay::channel(64);
        let outcome = other
            .stop(StopOptions {
                mode: StopMode::Blocking,
                progress: Some(relay),
            })
            .await
            .unwrap();

        assert!(matches!(
            outcome.report.processing,
            ProcessingSummary::Completed { .. }
        ));
        assert!(!controller.is_recording().unwrap());
        assert_eq!(controller.status().unwrap().state, RecordingState::Idle);

        let metadata = metadata::read_metadata(&report.output_dir).unwrap();
        assert_eq!(metadata.status, RecordingState::Completed);
        assert_eq!(
            metadata.outputs.merged,
            Some(report.output_dir.join("merged.mp4"))
        );

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&ProgressKind::Started));
        assert!(kinds.contains(&ProgressKind::Progress { percent: 50.0 }));
        assert_eq!(kinds.last(), Some(&ProgressKind::Completed));
    }

    #[tokio::test]
    async fn test_pause_resume_numbers_parts() {
        let env = Env::new();
        let controller = env.controller();
        let started = controller
            .start(options(&[SourceKind::Screen, SourceKind::Audio]))
            .await
            .unwrap();

        let paused = controller.pause().await.unwrap();
        assert_eq!(paused.next_part, 1);
        let status = controller.status().unwrap();
        assert_eq!(status.state, RecordingState::Paused);
        assert_eq!(status.part, Some(1));
        assert!(status.sources.is_empty());
        assert!(matches!(
            controller.pause().await,
            Err(RecordingError::AlreadyPaused)
        ));

        let resumed = env.controller().resume().await.unwrap();
        assert_eq!(resumed.part, 1);
        assert_eq!(resumed.output_dir, started.output_dir);
        assert!(controller.is_recording().unwrap());
        assert!(matches!(
            controller.resume().await,
            Err(RecordingError::NotPaused)
        ));

        let metadata = metadata::read_metadata(&started.output_dir).unwrap();
        assert_eq!(
            metadata.parts[&SourceKind::Screen],
            vec![
                started.output_dir.join("screen_part000.raw"),
                started.output_dir.join("screen_part001.raw"),
            ]
        );
        assert_eq!(metadata.parts[&SourceKind::Audio].len(), 2);
        assert_eq!(metadata.pause_count, 1);

        controller
            .stop(StopOptions {
                mode: StopMode::SkipProcessing,
                progress: None,
            })
            .await
            .unwrap();
        let metadata = metadata::read_metadata(&started.output_dir).unwrap();
        assert_eq!(metadata.status, RecordingState::Completed);
        assert_eq!(controller.status().unwrap().state, RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_preconditions() {
        let env = Env::new();
        let controller = env.controller();

        assert!(matches!(controller.pause().await, Err(RecordingError::NotRecording)));
        assert!(matches!(controller.resume().await, Err(RecordingError::NotRecording)));
        assert!(matches!(
            controller.stop(blocking()).await,
            Err(RecordingError::NotRecording)
        ));
        assert!(matches!(
            controller.start(options(&[])).await,
            Err(RecordingError::NoSourcesEnabled)
        ));

        controller.start(options(&[SourceKind::Screen])).await.unwrap();
        assert!(matches!(
            controller.start(options(&[SourceKind::Screen])).await,
            Err(RecordingError::AlreadyRecording)
        ));
        controller.stop(blocking()).await.unwrap();
    }

    #[tokio::test]
    async fn test_camera_only_launch_failure() {
        let env = Env::new();
        let controller = env.controller_with(&["/nonexistent/camera"], false);

        let result = controller.start(options(&[SourceKind::Camera])).await;

        assert!(matches!(result, Err(RecordingError::NoSourcesStarted(_))));
        assert_eq!(
            result.unwrap_err().to_string(),
            "No recording sources started"
        );
        assert!(controller.store().source_records().unwrap().is_empty());
        assert_eq!(controller.status().unwrap().state, RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_crashed_sources_are_reported_and_stoppable() {
        let env = Env::new();
        let controller = env.controller();
        controller.start(options(&[SourceKind::Screen])).await.unwrap();

        let status = controller.status().unwrap();
        let pid = status.sources[0].pid;
        controller
            .store()
            .processes()
            .send_signal(pid, Signal::Kill)
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let status = controller.status().unwrap();
        assert_eq!(status.state, RecordingState::Crashed);
        assert_eq!(status.crashed_sources, vec![SourceKind::Screen]);

        controller.stop(blocking()).await.unwrap();
        assert_eq!(controller.status().unwrap().state, RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_failed_merge_marks_metadata_failed() {
        let env = Env::new();
        let controller = env.controller_with(&["sleep", "30"], true);
        let report = controller.start(options(&[SourceKind::Screen])).await.unwrap();

        let outcome = controller.stop(blocking()).await.unwrap();

        assert!(matches!(
            outcome.report.processing,
            ProcessingSummary::Failed { .. }
        ));
        let metadata = metadata::read_metadata(&report.output_dir).unwrap();
        assert_eq!(metadata.status, RecordingState::Failed);
        assert!(metadata.errors.iter().any(|e| e.contains("encoder exploded")));
        // A new session may start right away
        assert_eq!(controller.status().unwrap().state, RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_panicking_pipeline_marks_session_failed() {
        let env = Env::new();
        let controller = env.controller_with_pipeline(&["sleep", "30"], Arc::new(PanickingPipeline));
        let mut events = controller.subscribe();
        let report = controller.start(options(&[SourceKind::Screen])).await.unwrap();

        let (relay, mut rx) = ProgressRelay::channel(8);
        let outcome = controller
            .stop(StopOptions {
                mode: StopMode::Blocking,
                progress: Some(relay),
            })
            .await
            .unwrap();

        let ProcessingSummary::Failed { error } = outcome.report.processing else {
            panic!("expected a failed merge");
        };
        assert!(error.contains("aborted"));

        let metadata = metadata::read_metadata(&report.output_dir).unwrap();
        assert_eq!(metadata.status, RecordingState::Failed);
        assert!(metadata.errors.iter().any(|e| e.contains("aborted")));

        let status = controller.status().unwrap();
        assert_eq!(status.state, RecordingState::Idle);
        assert_eq!(status.processing_dir, None);

        // The listener still sees the stream end
        while rx.recv().await.is_some() {}

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RecordingEvent::Failed { .. }) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_missing_metadata_does_not_leave_session_processing() {
        let env = Env::new();
        let controller = env.controller();
        let report = controller.start(options(&[SourceKind::Screen])).await.unwrap();
        std::fs::remove_file(metadata::metadata_path(&report.output_dir)).unwrap();

        let outcome = controller.stop(blocking()).await.unwrap();

        let ProcessingSummary::Failed { error } = outcome.report.processing else {
            panic!("expected a failed merge");
        };
        assert!(error.contains("recording.json"));

        let status = controller.status().unwrap();
        assert_eq!(status.state, RecordingState::Idle);
        assert_eq!(status.processing_dir, None);
        assert!(!controller.store().has_record(RecordKey::Processing).unwrap());
    }

    #[tokio::test]
    async fn test_detached_stop_processes_in_background() {
        let env = Env::new();
        let controller = env.controller();
        let mut events = controller.subscribe();
        let report = controller.start(options(&[SourceKind::Audio])).await.unwrap();

        let outcome = controller
            .stop(StopOptions {
                mode: StopMode::Detached,
                progress: None,
            })
            .await
            .unwrap();
        assert!(matches!(outcome.report.processing, ProcessingSummary::Running));

        let merged = outcome.merge_task.unwrap().await.unwrap().unwrap();
        assert!(merged.merged.is_some());
        assert_eq!(
            metadata::read_metadata(&report.output_dir).unwrap().status,
            RecordingState::Completed
        );
        assert_eq!(controller.status().unwrap().processing_dir, None);

        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RecordingEvent::Completed { .. }) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn test_handoff_leaves_session_processing() {
        let env = Env::new();
        let controller = env.controller();
        let report = controller.start(options(&[SourceKind::Screen])).await.unwrap();

        controller
            .stop(StopOptions {
                mode: StopMode::Handoff,
                progress: None,
            })
            .await
            .unwrap();
        let status = controller.status().unwrap();
        assert_eq!(status.state, RecordingState::Processing);
        assert_eq!(status.processing_dir.as_deref(), Some(report.output_dir.as_path()));

        // Another invocation picks the session up by directory
        env.controller()
            .process(&report.output_dir, ProgressRelay::detached())
            .await
            .unwrap();
        assert_eq!(controller.status().unwrap().state, RecordingState::Idle);
    }
}
