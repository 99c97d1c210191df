//! Command line interface
//!
//! Every subcommand is a separate invocation; the session lives in the state
//! directory between them.

use crate::capture::{SourceKind, SourceSettings};
use crate::config::Config;
use crate::merge::ProcessingOptions;
use crate::recorder::StartOptions;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "recsync")]
#[command(about = "Synchronized screen, audio and camera recording sessions")]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, env = "RECSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a new recording session
    Start(StartArgs),

    /// Stop the session and process its recordings
    Stop(StopArgs),

    /// Stop the capture sources, keeping the session open
    Pause,

    /// Continue a paused session into a new part
    Resume,

    /// Show the current session
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Run post-processing for a stopped session directory
    Process {
        /// Session directory containing recording.json
        dir: PathBuf,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

impl Command {
    /// Whether results and errors should be printed as JSON
    pub fn json(&self) -> bool {
        match self {
            Command::Stop(args) => args.json,
            Command::Status { json } | Command::Process { json, .. } => *json,
            _ => false,
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Don't capture the screen
    #[arg(long)]
    pub no_screen: bool,

    /// Capture microphone audio
    #[arg(long)]
    pub audio: bool,

    /// Capture the camera
    #[arg(long)]
    pub camera: bool,

    /// Session directory (default: a timestamped directory under the output root)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Recording title, used for the merged file name
    #[arg(short, long)]
    pub title: Option<String>,

    #[arg(long, value_name = "DEVICE")]
    pub screen_device: Option<String>,

    #[arg(long, value_name = "DEVICE")]
    pub audio_device: Option<String>,

    #[arg(long, value_name = "DEVICE")]
    pub camera_device: Option<String>,

    /// Skip the denoise pass
    #[arg(long)]
    pub no_denoise: bool,

    /// Skip loudness normalization
    #[arg(long)]
    pub no_normalize: bool,
}

impl StartArgs {
    /// Enabled sources: the configured defaults adjusted by the flags
    pub fn kinds(&self, config: &Config) -> Vec<SourceKind> {
        let mut kinds = config.recording.default_sources.clone();
        if self.audio {
            kinds.push(SourceKind::Audio);
        }
        if self.camera {
            kinds.push(SourceKind::Camera);
        }
        if self.no_screen {
            kinds.retain(|k| *k != SourceKind::Screen);
        }
        kinds.sort();
        kinds.dedup();
        kinds
    }

    fn device(&self, kind: SourceKind) -> Option<String> {
        match kind {
            SourceKind::Screen => self.screen_device.clone(),
            SourceKind::Audio => self.audio_device.clone(),
            SourceKind::Camera => self.camera_device.clone(),
        }
    }

    pub fn to_options(&self, config: &Config) -> StartOptions {
        let sources = self
            .kinds(config)
            .into_iter()
            .map(|kind| SourceSettings::new(kind).with_device(self.device(kind)))
            .collect();

        let mut processing = ProcessingOptions::from(&config.processing);
        if self.no_denoise {
            processing.denoise = false;
        }
        if self.no_normalize {
            processing.normalize = false;
        }

        StartOptions {
            sources,
            output_dir: self.output_dir.clone(),
            title: self.title.clone(),
            processing,
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct StopArgs {
    /// Keep the raw parts and skip post-processing
    #[arg(long, conflicts_with = "detach")]
    pub no_process: bool,

    /// Return immediately and process in a background process
    #[arg(long)]
    pub detach: bool,

    /// Print machine-readable JSON
    #[arg(long)]
    pub json: bool,
}
