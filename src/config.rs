//! Configuration management for recsync

use crate::capture::SourceKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_PATH_ENV: &str = "RECSYNC_CONFIG";
const STATE_DIR_ENV: &str = "RECSYNC_STATE_DIR";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where session state records live
    #[serde(default)]
    pub state: StateConfig,

    /// Session coordination timing and defaults
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Capture command templates per source
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Post-processing options
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// State directory override
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Parent directory for new session directories
    pub output_root: Option<PathBuf>,

    /// Bound on each synchronized-start phase (ready, then started)
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// How long a source gets to exit after SIGINT
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// How long to wait for exit after SIGKILL
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,

    /// Liveness polling interval while waiting for exit
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a freshly launched process must survive to count as started
    #[serde(default = "default_launch_settle_ms")]
    pub launch_settle_ms: u64,

    /// Fail the whole start when screen capture can't start
    #[serde(default = "default_true")]
    pub require_screen: bool,

    /// Sources enabled when the command line doesn't say otherwise
    #[serde(default = "default_sources")]
    pub default_sources: Vec<SourceKind>,
}

/// How to launch one capture tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCommand {
    /// Argument vector, program first. `{output}` and `{device}` are substituted.
    pub command: Vec<String>,

    /// Device used when the session doesn't pick one
    pub device: String,

    /// Extension of the produced files
    pub extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_screen_command")]
    pub screen: SourceCommand,

    #[serde(default = "default_audio_command")]
    pub audio: SourceCommand,

    #[serde(default = "default_camera_command")]
    pub camera: SourceCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,

    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,

    /// Run a denoise pass over the audio track
    #[serde(default = "default_true")]
    pub denoise: bool,

    /// Two-pass loudness normalization of the audio track
    #[serde(default = "default_true")]
    pub normalize: bool,

    /// Integrated loudness target in LUFS
    #[serde(default = "default_loudness_target")]
    pub loudness_target: f64,

    /// Overlay the camera stream onto the screen stream
    #[serde(default = "default_true")]
    pub camera_overlay: bool,

    /// Also export an audio-only file
    #[serde(default = "default_true")]
    pub derive_audio: bool,

    /// Progress events buffered for a slow listener
    #[serde(default = "default_relay_capacity")]
    pub relay_capacity: usize,
}

// Default value functions
fn default_start_timeout_ms() -> u64 {
    5000
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_kill_timeout_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_launch_settle_ms() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_sources() -> Vec<SourceKind> {
    vec![SourceKind::Screen]
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_loudness_target() -> f64 {
    -16.0
}

fn default_relay_capacity() -> usize {
    32
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn default_screen_command() -> SourceCommand {
    SourceCommand {
        command: argv(&[
            "ffmpeg", "-nostdin", "-hide_banner", "-loglevel", "error",
            "-f", "x11grab", "-framerate", "30", "-i", "{device}",
            "-c:v", "libx264", "-preset", "ultrafast", "-crf", "23",
            "-y", "{output}",
        ]),
        device: ":0.0".to_string(),
        extension: "mkv".to_string(),
    }
}

fn default_audio_command() -> SourceCommand {
    SourceCommand {
        command: argv(&[
            "ffmpeg", "-nostdin", "-hide_banner", "-loglevel", "error",
            "-f", "pulse", "-i", "{device}",
            "-ac", "1", "-ar", "48000",
            "-y", "{output}",
        ]),
        device: "default".to_string(),
        extension: "wav".to_string(),
    }
}

fn default_camera_command() -> SourceCommand {
    SourceCommand {
        command: argv(&[
            "ffmpeg", "-nostdin", "-hide_banner", "-loglevel", "error",
            "-f", "v4l2", "-framerate", "30", "-video_size", "1280x720", "-i", "{device}",
            "-c:v", "libx264", "-preset", "ultrafast",
            "-y", "{output}",
        ]),
        device: "/dev/video0".to_string(),
        extension: "mkv".to_string(),
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_root: None,
            start_timeout_ms: default_start_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            launch_settle_ms: default_launch_settle_ms(),
            require_screen: true,
            default_sources: default_sources(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            screen: default_screen_command(),
            audio: default_audio_command(),
            camera: default_camera_command(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            denoise: true,
            normalize: true,
            loudness_target: default_loudness_target(),
            camera_overlay: true,
            derive_audio: true,
            relay_capacity: default_relay_capacity(),
        }
    }
}

impl SourcesConfig {
    pub fn get(&self, kind: SourceKind) -> &SourceCommand {
        match kind {
            SourceKind::Screen => &self.screen,
            SourceKind::Audio => &self.audio,
            SourceKind::Camera => &self.camera,
        }
    }

    pub fn get_mut(&mut self, kind: SourceKind) -> &mut SourceCommand {
        match kind {
            SourceKind::Screen => &mut self.screen,
            SourceKind::Audio => &mut self.audio,
            SourceKind::Camera => &mut self.camera,
        }
    }
}

impl RecordingConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn launch_settle(&self) -> Duration {
        Duration::from_millis(self.launch_settle_ms)
    }
}

impl Config {
    /// Load configuration from `RECSYNC_CONFIG` or the default location.
    /// A missing file means defaults.
    pub fn load() -> Result<Self> {
        let config_path = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => PathBuf::from(path),
            None => Self::default_config_path()?,
        };
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: PathBuf) -> Result<Self> {
        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?
        } else {
            Config::default()
        };

        config.config_path = Some(config_path);
        Ok(config)
    }

    /// Get the config file path, if one was resolved
    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }

    /// Effective configuration rendered as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "recsync", "recsync")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Directory of the session state records
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = &self.state.dir {
            return Ok(dir.clone());
        }

        let proj_dirs = directories::ProjectDirs::from("dev", "recsync", "recsync")
            .context("Failed to determine state directory")?;
        let base = proj_dirs
            .state_dir()
            .unwrap_or_else(|| proj_dirs.data_local_dir());
        Ok(base.join("state"))
    }

    /// Parent directory for new session directories
    pub fn output_root(&self) -> PathBuf {
        if let Some(root) = &self.recording.output_root {
            return root.clone();
        }

        directories::UserDirs::new()
            .and_then(|dirs| dirs.video_dir().map(|v| v.join("recsync")))
            .or_else(|| {
                directories::ProjectDirs::from("dev", "recsync", "recsync")
                    .map(|p| p.data_local_dir().join("recordings"))
            })
            .unwrap_or_else(|| std::env::temp_dir().join("recsync-recordings"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.recording.start_timeout(), Duration::from_secs(5));
        assert_eq!(config.recording.stop_grace(), Duration::from_secs(2));
        assert!(config.recording.require_screen);
        assert_eq!(config.recording.default_sources, vec![SourceKind::Screen]);
        assert_eq!(config.sources.get(SourceKind::Audio).extension, "wav");
        assert!(config.config_path().is_some());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[recording]
stop_grace_ms = 500
default_sources = ["screen", "audio"]

[sources.camera]
command = ["my-cam", "--out", "{output}"]
device = "cam0"
extension = "mp4"

[processing]
denoise = false
"#,
        )
        .unwrap();

        let config = Config::load_from(path).unwrap();
        assert_eq!(config.recording.stop_grace_ms, 500);
        assert_eq!(config.recording.start_timeout_ms, 5000);
        assert_eq!(
            config.recording.default_sources,
            vec![SourceKind::Screen, SourceKind::Audio]
        );
        assert_eq!(config.sources.camera.command[0], "my-cam");
        assert_eq!(config.sources.screen, default_screen_command());
        assert!(!config.processing.denoise);
        assert!(config.processing.normalize);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[recording\nstop_grace_ms = ").unwrap();

        assert!(Config::load_from(path).is_err());
    }

    #[test]
    fn test_explicit_state_dir_wins_over_project_dirs() {
        let mut config = Config::default();
        config.state.dir = Some(PathBuf::from("/var/tmp/recsync-state"));
        if std::env::var_os(STATE_DIR_ENV).is_none() {
            assert_eq!(
                config.state_dir().unwrap(),
                PathBuf::from("/var/tmp/recsync-state")
            );
        }
    }

    #[test]
    fn test_effective_config_renders_as_toml() {
        let rendered = Config::default().to_toml().unwrap();
        assert!(rendered.contains("[recording]"));
        assert!(rendered.contains("{output}"));
    }
}
