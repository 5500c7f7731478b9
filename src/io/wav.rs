//! In-memory PCM waveform with WAV file I/O.

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::Result;

/// Interleaved floating point samples in [-1.0, 1.0]
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    pub fn empty_like(other: &Waveform) -> Self {
        Self::new(Vec::new(), other.sample_rate, other.channels)
    }

    /// Number of sample frames (one sample per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Frame index nearest to a timestamp, clamped to the waveform
    pub fn frame_at(&self, seconds: f64) -> usize {
        let frame = (seconds.max(0.0) * self.sample_rate as f64).round() as usize;
        frame.min(self.frames())
    }

    /// Copy of the frames between two timestamps
    pub fn slice_secs(&self, start: f64, end: f64) -> Waveform {
        let first = self.frame_at(start);
        let last = self.frame_at(end).max(first);
        let channels = self.channels as usize;
        Waveform::new(
            self.samples[first * channels..last * channels].to_vec(),
            self.sample_rate,
            self.channels,
        )
    }

    pub fn is_compatible(&self, other: &Waveform) -> bool {
        self.sample_rate == other.sample_rate && self.channels == other.channels
    }

    pub fn extend_from(&mut self, other: &Waveform) {
        self.samples.extend_from_slice(&other.samples);
    }

    /// Read a WAV file of any integer or float sample format
    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();

        let samples = match spec.sample_format {
            SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()?,
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        Ok(Self::new(samples, spec.sample_rate, spec.channels))
    }

    /// Write as 16-bit PCM
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let spec = WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(value)?;
        }
        writer.finalize()?;
        Ok(())
    }
}

/// Duration of a WAV file from its header
pub fn wav_duration(path: &Path) -> Result<f64> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Ok(0.0);
    }
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}
