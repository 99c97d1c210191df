//! Capture sources
//!
//! One uniform wrapper per external capture process (screen, audio, camera),
//! and the registry that maps each source kind to its launcher.

pub mod command;
pub mod traits;

use crate::config::Config;
use crate::store::ProcessController;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use command::{expand_template, CommandSource, ProcessTiming};
pub use traits::{
    part_path, CaptureError, CaptureResult, CaptureSource, SourceHandle, SourceHealth,
    SourceKind, SourceSettings,
};

/// The set of capture sources this installation can launch, keyed by kind
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<SourceKind, Arc<dyn CaptureSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command-backed sources for every kind, from configuration
    pub fn from_config(config: &Config, processes: Arc<dyn ProcessController>) -> Self {
        let timing = ProcessTiming::from(&config.recording);
        let mut registry = Self::new();
        for kind in SourceKind::ALL {
            registry.insert(Arc::new(CommandSource::new(
                kind,
                config.sources.get(kind).clone(),
                processes.clone(),
                timing,
            )));
        }
        registry
    }

    pub fn insert(&mut self, source: Arc<dyn CaptureSource>) {
        tracing::debug!("Registering capture source: {}", source.kind());
        self.sources.insert(source.kind(), source);
    }

    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn CaptureSource>> {
        self.sources.get(&kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = SourceKind> + '_ {
        self.sources.keys().copied()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.sources.keys()).finish()
    }
}
