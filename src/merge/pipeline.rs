//! Merge pipeline orchestration
//!
//! Turns a session's recorded parts into the final media: concatenation,
//! audio cleanup, loudness normalization, muxing and derived outputs.

use super::ffmpeg::{self, Ffmpeg, MuxInputs};
use super::types::{MergeError, MergeInput, MergeOutput, MergeStep, StepUpdate};
use crate::capture::SourceKind;
use crate::config::ProcessingConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the scratch directory inside the session's output directory
const WORK_DIR: &str = ".merge";

/// Post-processing stage that combines part files into final media.
///
/// `on_step` sees `Started` then exactly one of `Completed`, `Skipped` or
/// `Failed` for every step it reports. `on_percent` is optional and only
/// called between a step's `Started` and its terminal update.
pub trait MergePipeline: Send + Sync {
    fn run(
        &self,
        input: &MergeInput,
        on_step: &dyn Fn(MergeStep, StepUpdate),
        on_percent: Option<&dyn Fn(MergeStep, f32)>,
    ) -> Result<MergeOutput, MergeError>;
}

/// Default pipeline shelling out to ffmpeg
#[derive(Debug, Clone)]
pub struct FfmpegMergePipeline {
    ffmpeg: Ffmpeg,
}

impl FfmpegMergePipeline {
    pub fn new(ffmpeg: Ffmpeg) -> Self {
        Self { ffmpeg }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(Ffmpeg::new(&config.ffmpeg, &config.ffprobe))
    }

    /// Report a step around `f`, wrapping its error with the step name
    fn run_step<T>(
        step: MergeStep,
        on_step: &dyn Fn(MergeStep, StepUpdate),
        f: impl FnOnce() -> Result<T, MergeError>,
    ) -> Result<T, MergeError> {
        tracing::info!("Merge step {} started", step);
        on_step(step, StepUpdate::Started);
        match f() {
            Ok(value) => {
                on_step(step, StepUpdate::Completed);
                Ok(value)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!("Merge step {} failed: {}", step, message);
                on_step(step, StepUpdate::Failed(message.clone()));
                Err(MergeError::Step { step, message })
            }
        }
    }

    fn skip(step: MergeStep, on_step: &dyn Fn(MergeStep, StepUpdate), reason: &str) {
        tracing::info!("Merge step {} skipped: {}", step, reason);
        on_step(step, StepUpdate::Skipped);
    }

    /// One file per source, concatenating multi-part sources into `work`
    fn concat_sources(
        &self,
        parts: &BTreeMap<SourceKind, Vec<PathBuf>>,
        work: &Path,
    ) -> Result<BTreeMap<SourceKind, PathBuf>, MergeError> {
        let mut streams = BTreeMap::new();
        for (kind, files) in parts {
            let joined = match files.as_slice() {
                [] => continue,
                [single] => single.clone(),
                many => {
                    let list = work.join(format!("{kind}.txt"));
                    std::fs::write(&list, ffmpeg::concat_list(many))?;
                    let ext = many[0]
                        .extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or("mkv");
                    let output = work.join(format!("{kind}.{ext}"));
                    self.ffmpeg.run(&ffmpeg::concat_args(&list, &output))?;
                    tracing::debug!("Joined {} {} parts into {:?}", many.len(), kind, output);
                    output
                }
            };
            streams.insert(*kind, joined);
        }
        Ok(streams)
    }
}

/// Parts whose files actually exist, in order
fn existing_parts(input: &MergeInput) -> BTreeMap<SourceKind, Vec<PathBuf>> {
    input
        .parts
        .iter()
        .map(|(kind, files)| {
            let present: Vec<PathBuf> = files
                .iter()
                .filter(|p| {
                    let exists = p.is_file();
                    if !exists {
                        tracing::warn!("Skipping missing {} part {:?}", kind, p);
                    }
                    exists
                })
                .cloned()
                .collect();
            (*kind, present)
        })
        .filter(|(_, files)| !files.is_empty())
        .collect()
}

impl MergePipeline for FfmpegMergePipeline {
    fn run(
        &self,
        input: &MergeInput,
        on_step: &dyn Fn(MergeStep, StepUpdate),
        on_percent: Option<&dyn Fn(MergeStep, f32)>,
    ) -> Result<MergeOutput, MergeError> {
        tracing::info!("Starting merge pipeline for {:?}", input.output_dir);

        let parts = existing_parts(input);
        if parts.is_empty() {
            return Err(MergeError::NoInputs);
        }

        let work = input.output_dir.join(WORK_DIR);
        std::fs::create_dir_all(&work)?;
        let result = self.run_steps(input, &parts, &work, on_step, on_percent);

        if let Err(e) = std::fs::remove_dir_all(&work) {
            tracing::warn!("Failed to remove merge scratch directory {:?}: {}", work, e);
        }
        result
    }
}

impl FfmpegMergePipeline {
    fn run_steps(
        &self,
        input: &MergeInput,
        parts: &BTreeMap<SourceKind, Vec<PathBuf>>,
        work: &Path,
        on_step: &dyn Fn(MergeStep, StepUpdate),
        on_percent: Option<&dyn Fn(MergeStep, f32)>,
    ) -> Result<MergeOutput, MergeError> {
        let options = &input.options;

        // 1. Concat
        let streams = if parts.values().any(|files| files.len() > 1) {
            Self::run_step(MergeStep::Concat, on_step, || {
                self.concat_sources(parts, work)
            })?
        } else {
            Self::skip(MergeStep::Concat, on_step, "single part per source");
            parts
                .iter()
                .filter_map(|(kind, files)| files.first().map(|f| (*kind, f.clone())))
                .collect()
        };

        let mut audio = streams.get(&SourceKind::Audio).cloned();

        // 2. Denoise
        match &audio {
            Some(source) if options.denoise => {
                let denoised = work.join("audio_denoised.wav");
                Self::run_step(MergeStep::Denoise, on_step, || {
                    self.ffmpeg.run(&ffmpeg::denoise_args(source, &denoised))
                })?;
                audio = Some(denoised);
            }
            Some(_) => Self::skip(MergeStep::Denoise, on_step, "disabled"),
            None => Self::skip(MergeStep::Denoise, on_step, "no audio"),
        }

        // 3. Analyze + 4. Normalize
        match &audio {
            Some(source) if options.normalize => {
                let measured = Self::run_step(MergeStep::Analyze, on_step, || {
                    let stderr = self
                        .ffmpeg
                        .run(&ffmpeg::analyze_args(source, options.loudness_target))?;
                    ffmpeg::parse_loudnorm(&stderr)
                })?;
                tracing::info!(
                    "Measured loudness {} LUFS (target {})",
                    measured.input_i,
                    options.loudness_target
                );

                let normalized = work.join("audio_normalized.wav");
                Self::run_step(MergeStep::Normalize, on_step, || {
                    self.ffmpeg.run(&ffmpeg::normalize_args(
                        source,
                        &normalized,
                        options.loudness_target,
                        &measured,
                    ))
                })?;
                audio = Some(normalized);
            }
            _ => {
                let reason = if audio.is_some() { "disabled" } else { "no audio" };
                Self::skip(MergeStep::Analyze, on_step, reason);
                Self::skip(MergeStep::Normalize, on_step, reason);
            }
        }

        // 5. Merge
        let screen = streams.get(&SourceKind::Screen);
        let camera = streams.get(&SourceKind::Camera);
        let has_video = screen.is_some() || camera.is_some();
        let base = ffmpeg::slug(&input.title);
        let merged = input
            .output_dir
            .join(format!("{}.{}", base, if has_video { "mp4" } else { "m4a" }));

        let mux = MuxInputs {
            screen: screen.map(PathBuf::as_path),
            camera: camera.map(PathBuf::as_path),
            audio: audio.as_deref(),
            overlay: options.camera_overlay,
        };
        let duration = mux
            .screen
            .or(mux.camera)
            .or(mux.audio)
            .and_then(|p| self.ffmpeg.media_duration(p));

        Self::run_step(MergeStep::Merge, on_step, || {
            let report = |percent: f32| {
                if let Some(on_percent) = on_percent {
                    on_percent(MergeStep::Merge, percent);
                }
            };
            self.ffmpeg
                .run_with_progress(&ffmpeg::merge_args(mux, &merged), duration, &report)
        })?;

        // 6. Derive
        let derived_audio = match &audio {
            Some(source) if options.derive_audio && has_video => {
                let output = input.output_dir.join(format!("{base}.m4a"));
                Self::run_step(MergeStep::Derive, on_step, || {
                    self.ffmpeg.run(&ffmpeg::derive_audio_args(source, &output))
                })?;
                Some(output)
            }
            Some(_) if !has_video => {
                Self::skip(MergeStep::Derive, on_step, "merged output is already audio-only");
                None
            }
            Some(_) => {
                Self::skip(MergeStep::Derive, on_step, "disabled");
                None
            }
            None => {
                Self::skip(MergeStep::Derive, on_step, "no audio");
                None
            }
        };

        tracing::info!("Merge complete: {:?}", merged);
        Ok(MergeOutput {
            merged: Some(merged),
            derived_audio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::types::ProcessingOptions;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    fn broken_pipeline() -> FfmpegMergePipeline {
        FfmpegMergePipeline::new(Ffmpeg::new(
            "/nonexistent/ffmpeg",
            "/nonexistent/ffprobe",
        ))
    }

    fn input(dir: &Path, parts: BTreeMap<SourceKind, Vec<PathBuf>>) -> MergeInput {
        MergeInput {
            parts,
            output_dir: dir.to_path_buf(),
            title: "Demo".to_string(),
            options: ProcessingOptions {
                denoise: false,
                normalize: false,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_no_existing_parts_is_no_inputs() {
        let dir = tempdir().unwrap();
        let mut parts = BTreeMap::new();
        parts.insert(SourceKind::Screen, vec![dir.path().join("gone.mkv")]);

        let result = broken_pipeline().run(&input(dir.path(), parts), &|_, _| {}, None);
        assert!(matches!(result, Err(MergeError::NoInputs)));
    }

    #[test]
    fn test_step_order_and_failure_reporting() {
        let dir = tempdir().unwrap();
        let audio = dir.path().join("audio_part000.wav");
        std::fs::write(&audio, b"x").unwrap();
        let mut parts = BTreeMap::new();
        parts.insert(SourceKind::Audio, vec![audio]);

        let seen = Mutex::new(Vec::new());
        let result = broken_pipeline().run(
            &input(dir.path(), parts),
            &|step, update| seen.lock().push((step, update)),
            None,
        );

        assert!(matches!(
            result,
            Err(MergeError::Step {
                step: MergeStep::Merge,
                ..
            })
        ));
        let seen = seen.into_inner();
        let steps: Vec<MergeStep> = seen.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            steps,
            vec![
                MergeStep::Concat,
                MergeStep::Denoise,
                MergeStep::Analyze,
                MergeStep::Normalize,
                MergeStep::Merge,
                MergeStep::Merge,
            ]
        );
        assert_eq!(seen[0].1, StepUpdate::Skipped);
        assert_eq!(seen[4].1, StepUpdate::Started);
        assert!(matches!(seen[5].1, StepUpdate::Failed(_)));
        // Scratch space is cleaned up even on failure
        assert!(!dir.path().join(WORK_DIR).exists());
    }

    #[test]
    fn test_multi_part_source_runs_concat_step() {
        let dir = tempdir().unwrap();
        let mut files = Vec::new();
        for i in 0..2 {
            let p = dir.path().join(format!("screen_part00{i}.mkv"));
            std::fs::write(&p, b"x").unwrap();
            files.push(p);
        }
        let mut parts = BTreeMap::new();
        parts.insert(SourceKind::Screen, files);

        let seen = Mutex::new(Vec::new());
        let result = broken_pipeline().run(
            &input(dir.path(), parts),
            &|step, update| seen.lock().push((step, update)),
            None,
        );

        assert!(matches!(
            result,
            Err(MergeError::Step {
                step: MergeStep::Concat,
                ..
            })
        ));
        let seen = seen.into_inner();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (MergeStep::Concat, StepUpdate::Started));
    }
}
