//! FFmpeg invocation helpers for the merge pipeline
//!
//! Argument builders for each step, a runner that reads `-progress pipe:1`
//! output, and parsers for the bits of ffmpeg/ffprobe output we rely on.

use super::types::MergeError;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Loudness range and true-peak targets used by both loudnorm passes
const LOUDNORM_TP: f64 = -1.5;
const LOUDNORM_LRA: f64 = 11.0;

/// How much of ffmpeg's stderr ends up in an error message
const STDERR_TAIL_LINES: usize = 8;

/// Locations of the ffmpeg and ffprobe binaries
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: String,
    ffprobe: String,
}

impl Ffmpeg {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-hide_banner", "-nostdin", "-y"])
            .stdin(Stdio::null());
        command
    }

    /// Run ffmpeg to completion and return its stderr
    pub fn run(&self, args: &[String]) -> Result<String, MergeError> {
        tracing::debug!("Running ffmpeg {:?}", args);

        let output = self
            .command()
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| MergeError::Ffmpeg(format!("Failed to start {}: {}", self.ffmpeg, e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(MergeError::Ffmpeg(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr_tail(&stderr)
            )));
        }
        Ok(stderr)
    }

    /// Run ffmpeg, reporting percent complete against `duration` (seconds)
    pub fn run_with_progress(
        &self,
        args: &[String],
        duration: Option<f64>,
        on_percent: &dyn Fn(f32),
    ) -> Result<(), MergeError> {
        tracing::debug!("Running ffmpeg with progress {:?}", args);

        let mut child = self
            .command()
            .args(["-progress", "pipe:1", "-nostats"])
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MergeError::Ffmpeg(format!("Failed to start {}: {}", self.ffmpeg, e)))?;

        // Drain stderr on its own thread so a chatty ffmpeg can't block on a full pipe
        let stderr = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf);
            }
            buf
        });

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                match parse_progress_line(&line) {
                    Some(ProgressLine::OutTime(micros)) => {
                        if let Some(percent) = percent_of(micros, duration) {
                            on_percent(percent);
                        }
                    }
                    Some(ProgressLine::End) => on_percent(100.0),
                    None => {}
                }
            }
        }

        let status = child.wait()?;
        let stderr = stderr_reader.join().unwrap_or_default();
        if !status.success() {
            return Err(MergeError::Ffmpeg(format!(
                "ffmpeg exited with {}: {}",
                status,
                stderr_tail(&stderr)
            )));
        }
        Ok(())
    }

    /// Container duration in seconds. Probe failures are `None`.
    pub fn media_duration(&self, path: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output();

        match output {
            Ok(output) if output.status.success() => {
                parse_duration(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                tracing::debug!(
                    "ffprobe failed for {:?}: {}",
                    path,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Err(e) => {
                tracing::debug!("Failed to run {}: {}", self.ffprobe, e);
                None
            }
        }
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// A line of `-progress` output we care about
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressLine {
    /// Output position in microseconds
    OutTime(u64),
    End,
}

/// Parse one `key=value` line of `-progress pipe:1` output.
///
/// `out_time_ms` is reported in microseconds as well, despite its name.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.parse().ok().map(ProgressLine::OutTime),
        "progress" if value == "end" => Some(ProgressLine::End),
        _ => None,
    }
}

/// Percent of `duration` seconds covered by `micros`
pub fn percent_of(micros: u64, duration: Option<f64>) -> Option<f32> {
    let total = duration.filter(|d| *d > 0.0)?;
    let percent = micros as f64 / (total * 1_000_000.0) * 100.0;
    Some(percent.clamp(0.0, 100.0) as f32)
}

fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .find_map(|l| l.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Contents of a concat-demuxer list file
pub fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

/// Stream-copy the files named in `list_file` into `output`
pub fn concat_args(list_file: &Path, output: &Path) -> Vec<String> {
    let mut a = args(&["-f", "concat", "-safe", "0", "-i"]);
    a.push(path_arg(list_file));
    a.extend(args(&["-c", "copy"]));
    a.push(path_arg(output));
    a
}

pub fn denoise_args(input: &Path, output: &Path) -> Vec<String> {
    let mut a = args(&["-i"]);
    a.push(path_arg(input));
    a.extend(args(&["-vn", "-af", "afftdn", "-c:a", "pcm_s16le"]));
    a.push(path_arg(output));
    a
}

/// First loudnorm pass: measure only, JSON summary on stderr
pub fn analyze_args(input: &Path, target: f64) -> Vec<String> {
    let mut a = args(&["-i"]);
    a.push(path_arg(input));
    a.extend([
        "-vn".to_string(),
        "-af".to_string(),
        format!(
            "loudnorm=I={}:TP={}:LRA={}:print_format=json",
            target, LOUDNORM_TP, LOUDNORM_LRA
        ),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ]);
    a
}

/// Second loudnorm pass using the first pass's measurement
pub fn normalize_args(
    input: &Path,
    output: &Path,
    target: f64,
    measured: &LoudnessMeasurement,
) -> Vec<String> {
    let mut a = args(&["-i"]);
    a.push(path_arg(input));
    a.extend([
        "-vn".to_string(),
        "-af".to_string(),
        format!(
            "loudnorm=I={}:TP={}:LRA={}:measured_I={}:measured_TP={}:measured_LRA={}:measured_thresh={}:offset={}:linear=true",
            target,
            LOUDNORM_TP,
            LOUDNORM_LRA,
            measured.input_i,
            measured.input_tp,
            measured.input_lra,
            measured.input_thresh,
            measured.target_offset
        ),
        "-ar".to_string(),
        "48000".to_string(),
        "-c:a".to_string(),
        "pcm_s16le".to_string(),
    ]);
    a.push(path_arg(output));
    a
}

/// Streams going into the final mux
#[derive(Debug, Clone, Copy, Default)]
pub struct MuxInputs<'a> {
    pub screen: Option<&'a Path>,
    pub camera: Option<&'a Path>,
    pub audio: Option<&'a Path>,
    /// Picture-in-picture camera in the bottom-right corner
    pub overlay: bool,
}

/// Mux the final file. Without any video this is an audio-only encode.
pub fn merge_args(inputs: MuxInputs<'_>, output: &Path) -> Vec<String> {
    let mut a = Vec::new();
    let mut next_index = 0usize;
    let mut input = |a: &mut Vec<String>, path: &Path| {
        a.push("-i".to_string());
        a.push(path_arg(path));
        next_index += 1;
        next_index - 1
    };

    let primary = inputs.screen.or(inputs.camera);
    let video_index = primary.map(|p| input(&mut a, p));
    let overlay_index = match (inputs.screen, inputs.camera) {
        (Some(_), Some(camera)) if inputs.overlay => Some(input(&mut a, camera)),
        _ => None,
    };
    let audio_index = inputs.audio.map(|p| input(&mut a, p));

    if let Some(video) = video_index {
        match overlay_index {
            Some(camera) => a.extend([
                "-filter_complex".to_string(),
                format!(
                    "[{camera}:v]scale=iw/4:-2[cam];[{video}:v][cam]overlay=W-w-20:H-h-20[v]"
                ),
                "-map".to_string(),
                "[v]".to_string(),
            ]),
            None => a.extend(["-map".to_string(), format!("{video}:v:0")]),
        }
        a.extend(args(&[
            "-c:v", "libx264", "-preset", "veryfast", "-crf", "23", "-pix_fmt", "yuv420p",
        ]));
    }

    if let Some(audio) = audio_index {
        a.extend(["-map".to_string(), format!("{audio}:a:0")]);
        a.extend(args(&["-c:a", "aac", "-b:a", "192k"]));
    }

    a.extend(args(&["-movflags", "+faststart"]));
    a.push(path_arg(output));
    a
}

/// Audio-only export of a processed audio stream
pub fn derive_audio_args(input: &Path, output: &Path) -> Vec<String> {
    let mut a = args(&["-i"]);
    a.push(path_arg(input));
    a.extend(args(&["-vn", "-c:a", "aac", "-b:a", "192k"]));
    a.push(path_arg(output));
    a
}

/// First-pass loudnorm measurement
#[derive(Debug, Clone, PartialEq)]
pub struct LoudnessMeasurement {
    pub input_i: f64,
    pub input_tp: f64,
    pub input_lra: f64,
    pub input_thresh: f64,
    pub target_offset: f64,
}

#[derive(Deserialize)]
struct RawLoudnorm {
    input_i: String,
    input_tp: String,
    input_lra: String,
    input_thresh: String,
    target_offset: String,
}

/// Extract the loudnorm JSON block from ffmpeg's stderr
pub fn parse_loudnorm(stderr: &str) -> Result<LoudnessMeasurement, MergeError> {
    let end = stderr
        .rfind('}')
        .ok_or_else(|| MergeError::Analysis("no loudnorm summary in output".to_string()))?;
    let start = stderr[..end]
        .rfind('{')
        .ok_or_else(|| MergeError::Analysis("no loudnorm summary in output".to_string()))?;

    let raw: RawLoudnorm = serde_json::from_str(&stderr[start..=end])
        .map_err(|e| MergeError::Analysis(format!("malformed loudnorm summary: {}", e)))?;

    let field = |name: &str, value: &str| -> Result<f64, MergeError> {
        let parsed: f64 = value
            .trim()
            .parse()
            .map_err(|_| MergeError::Analysis(format!("{} is not a number: {:?}", name, value)))?;
        // Silence measures as -inf, which loudnorm can't take back
        if parsed.is_finite() {
            Ok(parsed)
        } else {
            Err(MergeError::Analysis(format!("{} is not finite (silent input?)", name)))
        }
    };

    Ok(LoudnessMeasurement {
        input_i: field("input_i", &raw.input_i)?,
        input_tp: field("input_tp", &raw.input_tp)?,
        input_lra: field("input_lra", &raw.input_lra)?,
        input_thresh: field("input_thresh", &raw.input_thresh)?,
        target_offset: field("target_offset", &raw.target_offset)?,
    })
}

/// File-name-safe form of a recording title
pub fn slug(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let out = out.trim_end_matches('-');
    if out.is_empty() {
        "recording".to_string()
    } else {
        out.to_string()
    }
}
