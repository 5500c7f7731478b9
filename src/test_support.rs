//! Fake collaborators and fixtures shared by unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::inference::{
    DiarizationProgress, Diarizer, Device, ModelHandle, ModelKind, ModelLoader, ModelRequest,
    SourceSeparator, SpeakerTurn, SpeechInterval, Transcriber, TranscriptSegment,
    VoiceActivityDetector,
};
use crate::io::media::WavMediaTool;
use crate::io::wav::Waveform;
use crate::resources::{lock, Accelerator};
use crate::scheduler::RunContext;

/// Run context over WAV media with a pool of two workers
pub fn run_context(
    config: PipelineConfig,
    loader: Arc<dyn ModelLoader>,
    accelerator: Option<Arc<dyn Accelerator>>,
) -> Arc<RunContext> {
    Arc::new(RunContext::new(
        config,
        loader,
        Arc::new(WavMediaTool),
        accelerator,
        2,
    ))
}

/// Write a mono sine tone of the given length
pub fn write_tone(path: &Path, seconds: f64, sample_rate: u32) {
    let frames = (seconds * sample_rate as f64).round() as usize;
    let samples = (0..frames)
        .map(|i| ((i as f32) * 0.07).sin() * 0.4)
        .collect();
    Waveform::new(samples, sample_rate, 1)
        .write(path)
        .expect("write tone fixture");
}

/// Accelerator whose allocation drops to a fixed level after a cleanup
pub struct FakeAccelerator {
    total: f64,
    allocated: Mutex<f64>,
    after_cleanup: f64,
    releases: AtomicUsize,
}

impl FakeAccelerator {
    pub fn new(total: f64, allocated: f64, after_cleanup: f64) -> Self {
        Self {
            total,
            allocated: Mutex::new(allocated),
            after_cleanup,
            releases: AtomicUsize::new(0),
        }
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl Accelerator for FakeAccelerator {
    fn name(&self) -> &str {
        "fake"
    }

    fn total_gb(&self) -> f64 {
        self.total
    }

    fn allocated_gb(&self) -> f64 {
        *lock(&self.allocated)
    }

    fn release_cached(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        *lock(&self.allocated) = self.after_cleanup;
    }
}

/// Separator that halves the amplitude and returns it as the vocals source
#[derive(Default)]
pub struct QuietSeparator {
    pub calls: AtomicUsize,
}

impl SourceSeparator for QuietSeparator {
    fn separate(&self, audio: &Waveform, _device: Device) -> anyhow::Result<Vec<Waveform>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let samples = audio.samples.iter().map(|s| s * 0.5).collect();
        Ok(vec![Waveform::new(samples, audio.sample_rate, audio.channels)])
    }
}

/// Separator that fails for audio of one exact length, or always when `None`
pub struct FailingSeparator {
    pub only_frames: Option<usize>,
    pub calls: AtomicUsize,
}

impl FailingSeparator {
    pub fn always() -> Self {
        Self {
            only_frames: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn for_frames(frames: usize) -> Self {
        Self {
            only_frames: Some(frames),
            calls: AtomicUsize::new(0),
        }
    }
}

impl SourceSeparator for FailingSeparator {
    fn separate(&self, audio: &Waveform, _device: Device) -> anyhow::Result<Vec<Waveform>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.only_frames {
            Some(frames) if frames != audio.frames() => Ok(vec![audio.clone()]),
            _ => anyhow::bail!("separator out of memory"),
        }
    }
}

/// Separator that blocks longer than any sensible test timeout
pub struct SlowSeparator(pub Duration);

impl SourceSeparator for SlowSeparator {
    fn separate(&self, audio: &Waveform, _device: Device) -> anyhow::Result<Vec<Waveform>> {
        std::thread::sleep(self.0);
        Ok(vec![audio.clone()])
    }
}

/// Returns the same window-relative segments for every window
pub struct ScriptedTranscriber {
    pub segments: Vec<TranscriptSegment>,
    pub calls: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn ending_at(ends: &[f64]) -> Self {
        Self {
            segments: ends
                .iter()
                .map(|&end| TranscriptSegment {
                    start: (end - 1.0).max(0.0),
                    end,
                    text: "words".to_string(),
                })
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl Transcriber for ScriptedTranscriber {
    fn transcribe(&self, _window: &Path) -> anyhow::Result<Vec<TranscriptSegment>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.segments.clone())
    }
}

/// Reports fixed intervals, keeping only those inside the audio
pub struct FixedVad(pub Vec<SpeechInterval>);

impl VoiceActivityDetector for FixedVad {
    fn detect(&self, audio: &Waveform, _device: Device) -> anyhow::Result<Vec<SpeechInterval>> {
        let duration = audio.duration_secs();
        Ok(self
            .0
            .iter()
            .filter(|i| i.start < duration)
            .copied()
            .collect())
    }
}

/// Diarizer returning scripted turns while probing its own concurrency
pub struct ScriptedDiarizer {
    pub turns: Vec<SpeakerTurn>,
    pub delay: Duration,
    pub fail: bool,
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedDiarizer {
    pub fn new(turns: Vec<SpeakerTurn>) -> Self {
        Self {
            turns,
            delay: Duration::ZERO,
            fail: false,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Diarizer for ScriptedDiarizer {
    fn diarize(
        &self,
        _audio: &Path,
        _device: Device,
        progress: &dyn DiarizationProgress,
    ) -> anyhow::Result<Vec<SpeakerTurn>> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        progress.report("segmentation", 1, Some(2));
        std::thread::sleep(self.delay);
        progress.report("embeddings", 2, Some(2));

        self.running.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("diarization pipeline crashed");
        }
        Ok(self.turns.clone())
    }
}

pub fn turn(label: &str, start: f64, end: f64) -> SpeakerTurn {
    SpeakerTurn {
        start,
        end,
        label: label.to_string(),
    }
}

/// Loader handing out configurable fakes while counting calls
pub struct CountingLoader {
    delay: Duration,
    unload_delay: Duration,
    fail_first: usize,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    credentials: Mutex<Vec<Option<String>>>,
    separator: Arc<dyn SourceSeparator>,
    transcriber: Arc<dyn Transcriber>,
    voice_activity: Arc<dyn VoiceActivityDetector>,
    diarizer: Arc<dyn Diarizer>,
    failing_kinds: Vec<ModelKind>,
}

impl CountingLoader {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            unload_delay: Duration::ZERO,
            fail_first: 0,
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            credentials: Mutex::new(Vec::new()),
            separator: Arc::new(QuietSeparator::default()),
            transcriber: Arc::new(ScriptedTranscriber::ending_at(&[])),
            voice_activity: Arc::new(FixedVad(vec![SpeechInterval {
                start: 0.0,
                end: f64::MAX,
            }])),
            diarizer: Arc::new(ScriptedDiarizer::new(Vec::new())),
            failing_kinds: Vec::new(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_unload_delay(mut self, delay: Duration) -> Self {
        self.unload_delay = delay;
        self
    }

    /// Fail the first `n` load calls
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Fail every load of `kind`
    pub fn failing_kind(mut self, kind: ModelKind) -> Self {
        self.failing_kinds.push(kind);
        self
    }

    pub fn with_separator(mut self, separator: Arc<dyn SourceSeparator>) -> Self {
        self.separator = separator;
        self
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = transcriber;
        self
    }

    pub fn with_voice_activity(mut self, vad: Arc<dyn VoiceActivityDetector>) -> Self {
        self.voice_activity = vad;
        self
    }

    pub fn with_diarizer(mut self, diarizer: Arc<dyn Diarizer>) -> Self {
        self.diarizer = diarizer;
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn credentials(&self) -> Vec<Option<String>> {
        lock(&self.credentials).clone()
    }
}

impl ModelLoader for CountingLoader {
    fn load(&self, request: &ModelRequest) -> anyhow::Result<ModelHandle> {
        let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
        lock(&self.credentials).push(request.credential.clone());
        std::thread::sleep(self.delay);

        if attempt < self.fail_first || self.failing_kinds.contains(&request.kind) {
            anyhow::bail!("weights for {} unavailable", request.kind);
        }

        Ok(match request.kind {
            ModelKind::Separation => ModelHandle::Separator(self.separator.clone()),
            ModelKind::Transcription => ModelHandle::Transcriber(self.transcriber.clone()),
            ModelKind::VoiceActivity => ModelHandle::VoiceActivity(self.voice_activity.clone()),
            ModelKind::Diarization => ModelHandle::Diarizer(self.diarizer.clone()),
        })
    }

    fn unload(&self, _handle: &ModelHandle) {
        std::thread::sleep(self.unload_delay);
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}
