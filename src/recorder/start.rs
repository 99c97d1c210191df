//! Synchronized start of capture sources
//!
//! Every enabled source gets its own task. Tasks prepare their launch, report
//! ready, then wait on a single barrier. The coordinator releases the barrier
//! once every source is ready (or the ready phase times out), naming the
//! sources admitted to launch, so all of them start from the same release.

use super::error::{RecordingError, RecordingResult, SourceWarning};
use super::stop::TeardownCoordinator;
use crate::capture::{
    part_path, CaptureSource, SourceHandle, SourceKind, SourceRegistry, SourceSettings,
};
use crate::store::StateStore;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

type Admitted = Option<Arc<BTreeSet<SourceKind>>>;

/// What a source task reports back to the coordinator
#[derive(Debug)]
enum StartSignal {
    Ready(SourceKind),
    Started(SourceHandle),
    Failed(SourceWarning),
}

/// Which sources to start, and where their files go
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub output_dir: PathBuf,
    pub part: u32,
    pub sources: Vec<SourceSettings>,
}

/// Sources running after a successful start
#[derive(Debug, Default)]
pub struct StartOutcome {
    pub started: Vec<SourceHandle>,
    pub warnings: Vec<SourceWarning>,
}

impl StartOutcome {
    pub fn kinds(&self) -> Vec<SourceKind> {
        self.started.iter().map(|h| h.kind).collect()
    }
}

#[derive(Debug, Clone)]
pub struct StartCoordinator {
    registry: SourceRegistry,
    store: StateStore,
    teardown: TeardownCoordinator,
    /// Bound on each phase (ready, then started)
    phase_timeout: Duration,
    require_screen: bool,
}

impl StartCoordinator {
    pub fn new(
        registry: SourceRegistry,
        store: StateStore,
        teardown: TeardownCoordinator,
        phase_timeout: Duration,
        require_screen: bool,
    ) -> Self {
        Self {
            registry,
            store,
            teardown,
            phase_timeout,
            require_screen,
        }
    }

    /// Start every requested source and persist a record for each one that runs.
    ///
    /// Fails when nothing started, or when screen capture was requested, is
    /// required and did not start. Either way nothing is left running and no
    /// source record is written.
    pub async fn start(&self, request: &StartRequest) -> RecordingResult<StartOutcome> {
        let mut warnings = Vec::new();
        let mut requested = BTreeMap::new();
        for settings in &request.sources {
            requested.entry(settings.kind).or_insert(settings);
        }
        if requested.is_empty() {
            return Err(RecordingError::NoSourcesEnabled);
        }

        tracing::info!(
            "Starting {} source(s) for part {} in {:?}",
            requested.len(),
            request.part,
            request.output_dir
        );

        // Each task sends at most two signals, so sends never wait on capacity
        let (signal_tx, mut signal_rx) = mpsc::channel(requested.len() * 2);
        let (barrier_tx, barrier_rx) = watch::channel::<Admitted>(None);

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut expected = BTreeSet::new();
        for (kind, settings) in &requested {
            let Some(source) = self.registry.get(*kind) else {
                warnings.push(SourceWarning::new(*kind, "no capture source configured"));
                continue;
            };
            let target = part_path(&request.output_dir, *kind, request.part, source.extension());
            expected.insert(*kind);
            tasks.push(tokio::spawn(run_source(
                source,
                target,
                settings.device.clone(),
                signal_tx.clone(),
                barrier_rx.clone(),
                self.teardown.clone(),
            )));
        }
        drop(signal_tx);
        drop(barrier_rx);

        // Ready phase
        let mut ready = BTreeSet::new();
        let mut settled = BTreeSet::new();
        let deadline = Instant::now() + self.phase_timeout;
        while settled.len() < expected.len() {
            match timeout_at(deadline, signal_rx.recv()).await {
                Ok(Some(StartSignal::Ready(kind))) => {
                    ready.insert(kind);
                    settled.insert(kind);
                }
                Ok(Some(StartSignal::Failed(warning))) => {
                    tracing::warn!("{} capture could not be prepared: {}", warning.kind, warning.message);
                    settled.insert(warning.kind);
                    warnings.push(warning);
                }
                Ok(Some(StartSignal::Started(handle))) => {
                    tracing::error!("{} capture launched before the barrier", handle.kind);
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        for kind in expected.difference(&settled) {
            tracing::warn!("{} capture not ready within {:?}, dropping it", kind, self.phase_timeout);
            warnings.push(SourceWarning::new(*kind, "not ready before the start timeout"));
        }

        // Release
        tracing::debug!("Releasing start barrier for {:?}", ready);
        barrier_tx.send_replace(Some(Arc::new(ready.clone())));

        // Started phase
        let mut started = Vec::new();
        let mut pending = ready.clone();
        let deadline = Instant::now() + self.phase_timeout;
        while !pending.is_empty() {
            match timeout_at(deadline, signal_rx.recv()).await {
                Ok(Some(StartSignal::Started(handle))) => {
                    pending.remove(&handle.kind);
                    started.push(handle);
                }
                Ok(Some(StartSignal::Failed(warning))) => {
                    tracing::warn!("{} capture failed to start: {}", warning.kind, warning.message);
                    pending.remove(&warning.kind);
                    warnings.push(warning);
                }
                Ok(Some(StartSignal::Ready(_))) => {}
                Ok(None) => break,
                Err(_) => break,
            }
        }
        for kind in &pending {
            tracing::warn!("{} capture did not confirm start within {:?}", kind, self.phase_timeout);
            warnings.push(SourceWarning::new(*kind, "did not start before the start timeout"));
        }

        // Anything confirmed from here on is too late: tasks whose send fails
        // stop their own process, already-buffered confirmations are stopped here
        signal_rx.close();
        let join_bound = self.phase_timeout + self.teardown.grace() * 2;
        if timeout(join_bound, join_all(tasks)).await.is_err() {
            tracing::warn!("Some start tasks still running after {:?}", join_bound);
        }
        let mut late = Vec::new();
        while let Ok(signal) = signal_rx.try_recv() {
            if let StartSignal::Started(handle) = signal {
                tracing::warn!("{} capture started too late, stopping it", handle.kind);
                late.push(handle);
            }
        }
        if !late.is_empty() {
            self.teardown.terminate_handles(late).await;
        }

        started.sort_by_key(|h| h.kind);
        self.finish(requested.keys().copied().collect(), started, warnings)
            .await
    }

    /// Apply the failure rules and persist the surviving sources
    async fn finish(
        &self,
        requested: BTreeSet<SourceKind>,
        started: Vec<SourceHandle>,
        mut warnings: Vec<SourceWarning>,
    ) -> RecordingResult<StartOutcome> {
        if started.is_empty() {
            tracing::error!("No recording sources started");
            return Err(RecordingError::NoSourcesStarted(warnings));
        }

        let screen_started = started.iter().any(|h| h.kind.is_primary());
        if requested.contains(&SourceKind::Screen) && !screen_started {
            let reason = warnings
                .iter()
                .find(|w| w.kind.is_primary())
                .map(|w| w.message.clone())
                .unwrap_or_else(|| "not started".to_string());

            if self.require_screen {
                tracing::error!("Screen capture failed ({}), stopping the other sources", reason);
                let outcome = self.teardown.terminate_handles(started).await;
                warnings.extend(outcome.warnings);
                return Err(RecordingError::PrimarySourceFailed { reason, warnings });
            }

            tracing::error!("Screen capture failed ({}), recording without it", reason);
            for warning in warnings.iter_mut().filter(|w| w.kind.is_primary()) {
                *warning = warning.clone().escalate();
            }
        }

        for handle in &started {
            let persisted = match handle.to_record() {
                Some(record) => self.store.write_source_record(&record),
                None => continue,
            };
            if let Err(e) = persisted {
                tracing::error!("Failed to persist {} capture record: {}", handle.kind, e);
                for kind in started.iter().map(|h| h.kind) {
                    if let Err(e) = self.store.clear_source_record(kind) {
                        tracing::warn!("Failed to clear {} capture record: {}", kind, e);
                    }
                }
                self.teardown.terminate_handles(started).await;
                return Err(e.into());
            }
        }

        tracing::info!(
            "Recording sources started: {:?}",
            started.iter().map(|h| h.kind).collect::<Vec<_>>()
        );
        Ok(StartOutcome { started, warnings })
    }
}

/// Wait for every task, ignoring how each one ended
async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Start task failed: {}", e);
        }
    }
}

/// One source's side of the start protocol
async fn run_source(
    source: Arc<dyn CaptureSource>,
    target: PathBuf,
    device: Option<String>,
    signals: mpsc::Sender<StartSignal>,
    mut barrier: watch::Receiver<Admitted>,
    teardown: TeardownCoordinator,
) {
    let kind = source.kind();

    let mut handle = match source.prepare(&target, device.as_deref()) {
        Ok(handle) => handle,
        Err(e) => {
            let _ = signals
                .send(StartSignal::Failed(SourceWarning::from_capture(kind, &e)))
                .await;
            return;
        }
    };
    if signals.send(StartSignal::Ready(kind)).await.is_err() {
        return;
    }

    let admitted = match barrier.wait_for(Option::is_some).await {
        Ok(released) => (*released).clone(),
        Err(_) => return,
    };
    if !admitted.is_some_and(|set| set.contains(&kind)) {
        tracing::debug!("{} capture not admitted, not launching", kind);
        return;
    }

    match source.launch(&mut handle).await {
        Ok(_) => {
            if let Err(mpsc::error::SendError(StartSignal::Started(handle))) =
                signals.send(StartSignal::Started(handle)).await
            {
                tracing::warn!("{} capture started after the coordinator gave up, stopping it", kind);
                teardown.terminate_handles(vec![handle]).await;
            }
        }
        Err(e) => {
            let _ = signals
                .send(StartSignal::Failed(SourceWarning::from_capture(kind, &e)))
                .await;
        }
    }
}
