//! Encode/decode/probe operations on audio files.
//!
//! The pipeline treats the media tool as a synchronous, path-in/path-out
//! collaborator. [`Ffmpeg`] shells out to `ffmpeg`/`ffprobe`; [`WavMediaTool`]
//! performs the same operations in-process for inputs that are already WAV.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::io::wav::{wav_duration, Waveform};

/// One time range of a source file to include in a concatenation
#[derive(Debug, Clone, PartialEq)]
pub struct ClipSpec {
    pub source: PathBuf,
    pub start: f64,
    pub end: f64,
}

impl ClipSpec {
    pub fn new(source: impl Into<PathBuf>, start: f64, end: f64) -> Self {
        Self {
            source: source.into(),
            start,
            end,
        }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

pub trait MediaTool: Send + Sync {
    /// Write `duration` seconds of `input` starting at `start` to `output`
    fn extract(&self, input: &Path, start: f64, duration: f64, output: &Path) -> Result<()>;

    /// Write the listed clips back to back into `output`
    fn concat(&self, clips: &[ClipSpec], output: &Path) -> Result<()>;

    /// Duration of `input` in seconds
    fn probe_duration(&self, input: &Path) -> Result<f64>;
}

/// Media tool backed by the `ffmpeg` and `ffprobe` executables
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    pub ffmpeg: String,
    pub ffprobe: String,
    /// Sample rate of extracted chunks (mono PCM)
    pub sample_rate: u32,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            sample_rate: 16_000,
        }
    }
}

impl Ffmpeg {
    fn run(&self, program: &str, args: &[String]) -> Result<Output> {
        debug!("Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| PipelineError::external_tool(program, format!("failed to start: {}", e)))?;

        if !output.status.success() {
            return Err(PipelineError::external_tool(
                program,
                format!("{}: {}", output.status, stderr_tail(&output.stderr)),
            ));
        }
        Ok(output)
    }

    fn pcm_args(&self) -> Vec<String> {
        vec![
            "-vn".to_string(),
            "-acodec".to_string(),
            "pcm_s16le".to_string(),
            "-ar".to_string(),
            self.sample_rate.to_string(),
            "-ac".to_string(),
            "1".to_string(),
        ]
    }
}

impl MediaTool for Ffmpeg {
    fn extract(&self, input: &Path, start: f64, duration: f64, output: &Path) -> Result<()> {
        ensure_parent(output)?;
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            format!("{:.3}", start),
            "-t".to_string(),
            format!("{:.3}", duration),
            "-i".to_string(),
            input.display().to_string(),
        ];
        args.extend(self.pcm_args());
        args.push(output.display().to_string());
        self.run(&self.ffmpeg, &args)?;
        Ok(())
    }

    fn concat(&self, clips: &[ClipSpec], output: &Path) -> Result<()> {
        if clips.is_empty() {
            return Err(PipelineError::external_tool(
                &self.ffmpeg,
                "nothing to concatenate",
            ));
        }
        ensure_parent(output)?;

        let list_path = output.with_extension("concat.txt");
        fs::write(&list_path, concat_list(clips))?;

        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            list_path.display().to_string(),
        ];
        args.extend(self.pcm_args());
        args.push(output.display().to_string());

        let result = self.run(&self.ffmpeg, &args);
        let _ = fs::remove_file(&list_path);
        result.map(|_| ())
    }

    fn probe_duration(&self, input: &Path) -> Result<f64> {
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            input.display().to_string(),
        ];
        let output = self.run(&self.ffprobe, &args)?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim().parse::<f64>().map_err(|_| {
            PipelineError::external_tool(
                &self.ffprobe,
                format!("unparseable duration '{}' for {:?}", text.trim(), input),
            )
        })
    }
}

/// Build an ffmpeg concat demuxer script
fn concat_list(clips: &[ClipSpec]) -> String {
    let mut list = String::new();
    for clip in clips {
        let path = clip.source.display().to_string().replace('\'', "'\\''");
        let _ = writeln!(list, "file '{}'", path);
        let _ = writeln!(list, "inpoint {:.3}", clip.start);
        let _ = writeln!(list, "outpoint {:.3}", clip.end);
    }
    list
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// In-process media tool for WAV inputs
#[derive(Debug, Clone, Copy, Default)]
pub struct WavMediaTool;

impl MediaTool for WavMediaTool {
    fn extract(&self, input: &Path, start: f64, duration: f64, output: &Path) -> Result<()> {
        let wave = Waveform::read(input)?;
        wave.slice_secs(start, start + duration).write(output)
    }

    fn concat(&self, clips: &[ClipSpec], output: &Path) -> Result<()> {
        let mut combined: Option<Waveform> = None;
        let mut loaded: Option<(PathBuf, Waveform)> = None;

        for clip in clips {
            let reuse = matches!(&loaded, Some((path, _)) if *path == clip.source);
            if !reuse {
                loaded = Some((clip.source.clone(), Waveform::read(&clip.source)?));
            }
            let Some((_, source)) = &loaded else {
                continue;
            };
            let piece = source.slice_secs(clip.start, clip.end);

            match combined.as_mut() {
                None => combined = Some(piece),
                Some(acc) if acc.is_compatible(&piece) => acc.extend_from(&piece),
                Some(acc) => {
                    return Err(PipelineError::external_tool(
                        "wav-concat",
                        format!(
                            "{:?} is {}Hz/{}ch, expected {}Hz/{}ch",
                            clip.source,
                            piece.sample_rate,
                            piece.channels,
                            acc.sample_rate,
                            acc.channels
                        ),
                    ));
                }
            }
        }

        match combined {
            Some(wave) => wave.write(output),
            None => Err(PipelineError::external_tool(
                "wav-concat",
                "nothing to concatenate",
            )),
        }
    }

    fn probe_duration(&self, input: &Path) -> Result<f64> {
        wav_duration(input)
    }
}
