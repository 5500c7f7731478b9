use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::stage1_denoise::file_stem;
use crate::config::SilenceConfig;
use crate::error::{PipelineError, Result};
use crate::inference::{Device, SpeechInterval, VoiceActivityDetector};
use crate::io::wav::Waveform;

/// Sort and clamp speech intervals to `[0, duration]`, join intervals
/// separated by less than `min_silence_secs`, then drop the ones shorter
/// than `min_speech_secs`.
pub fn merge_intervals(
    intervals: &[SpeechInterval],
    duration: f64,
    settings: &SilenceConfig,
) -> Vec<SpeechInterval> {
    let mut sorted: Vec<SpeechInterval> = intervals
        .iter()
        .filter(|i| i.start.is_finite() && !i.end.is_nan())
        .map(|i| SpeechInterval {
            start: i.start.clamp(0.0, duration),
            end: i.end.clamp(0.0, duration),
        })
        .filter(|i| i.end > i.start)
        .collect();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut merged: Vec<SpeechInterval> = Vec::with_capacity(sorted.len());
    for interval in sorted {
        match merged.last_mut() {
            Some(last)
                if interval.start <= last.end
                    || interval.start - last.end < settings.min_silence_secs =>
            {
                last.end = last.end.max(interval.end)
            }
            _ => merged.push(interval),
        }
    }
    merged.retain(|i| i.end - i.start >= settings.min_speech_secs);
    merged
}

/// Silence removal output
#[derive(Debug, Clone, PartialEq)]
pub struct SilenceRemoval {
    pub output: PathBuf,
    /// Speech spans kept, in seconds of the input; empty when the input
    /// passed through unchanged
    pub kept: Vec<SpeechInterval>,
}

/// Execute the silence removal stage
///
/// Writes `<stem>_nosilence.wav` holding only detected speech. When the
/// detector finds no speech at all the input is returned unchanged.
pub fn remove_silence(
    detector: &dyn VoiceActivityDetector,
    input: &Path,
    output_dir: &Path,
    device: Device,
    settings: &SilenceConfig,
) -> Result<SilenceRemoval> {
    let audio = Waveform::read(input)?;
    let detected = detector
        .detect(&audio, device)
        .map_err(|e| PipelineError::inference("silence_removal", e))?;

    let speech = merge_intervals(&detected, audio.duration_secs(), settings);
    if speech.is_empty() {
        warn!("Silence removal: no speech detected in {:?}, keeping input", input);
        return Ok(SilenceRemoval {
            output: input.to_path_buf(),
            kept: Vec::new(),
        });
    }

    let mut kept = Waveform::empty_like(&audio);
    for interval in &speech {
        kept.extend_from(&audio.slice_secs(interval.start, interval.end));
    }
    debug!(
        "Silence removal: {} intervals, {:.1}s -> {:.1}s",
        speech.len(),
        audio.duration_secs(),
        kept.duration_secs()
    );

    let output = output_dir.join(format!("{}_nosilence.wav", file_stem(input)));
    kept.write(&output)?;
    Ok(SilenceRemoval {
        output,
        kept: speech,
    })
}
