//! Diarize stage and the coordinator that serializes diarization calls.
//!
//! Any number of chunks may reach the diarize stage at once. The
//! [`DiarizationCoordinator`] lets exactly one of them run the collaborator
//! at a time; the others wait in the `Acquiring` state. The lock covers the
//! inference call only, not the segment bookkeeping and file writes around it.
//! Worker processes of one run additionally share an exclusive file lock.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::run_blocking;
use super::stage1_denoise::file_stem;
use crate::error::{PipelineError, Result};
use crate::inference::{DiarizationProgress, Diarizer, Device, SpeakerTurn};
use crate::io::media::{ClipSpec, MediaTool};
use crate::io::output::{chunk_speaker_metadata, write_rttm, RttmEntry};
use crate::models::{normalize_label, Chunk, SpeakerSegment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiarizationState {
    Idle,
    Acquiring,
    Running,
}

/// Run-wide mutual exclusion around the diarization collaborator
#[derive(Debug, Default)]
pub struct DiarizationCoordinator {
    gate: Arc<Mutex<()>>,
    acquiring: AtomicUsize,
    running: Arc<AtomicUsize>,
    peak_running: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    lock_file: Option<PathBuf>,
}

/// Decrements the running counter even if the collaborator panics
struct RunningSlot(Arc<AtomicUsize>);

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DiarizationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator that also holds an exclusive lock on `path` for every
    /// call, shared with other processes of the same run
    pub fn with_lock_file(path: impl Into<PathBuf>) -> Self {
        Self {
            lock_file: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn state(&self) -> DiarizationState {
        if self.running.load(Ordering::SeqCst) > 0 {
            DiarizationState::Running
        } else if self.acquiring.load(Ordering::SeqCst) > 0 {
            DiarizationState::Acquiring
        } else {
            DiarizationState::Idle
        }
    }

    /// Calls waiting for the lock
    pub fn acquiring(&self) -> usize {
        self.acquiring.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running calls observed
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Run one diarization call under the lock.
    ///
    /// The lock guard moves into the blocking task, so after a timeout the
    /// lock stays held until the abandoned call actually returns.
    pub async fn diarize(
        &self,
        diarizer: Arc<dyn Diarizer>,
        audio: PathBuf,
        device: Device,
        chunk: String,
        limit: Duration,
    ) -> Result<Vec<SpeakerTurn>> {
        self.acquiring.fetch_add(1, Ordering::SeqCst);
        debug!("{}: waiting for diarization lock", chunk);
        let guard = self.gate.clone().lock_owned().await;
        let file_lock = match &self.lock_file {
            Some(path) => lock_exclusive(path.clone()).await,
            None => Ok(None),
        };
        self.acquiring.fetch_sub(1, Ordering::SeqCst);
        let file_lock = file_lock?;

        let running = self.running.clone();
        let peak = self.peak_running.clone();
        let completed = self.completed.clone();

        run_blocking("diarize", limit, move || {
            let _guard = guard;
            let _file_lock = file_lock;
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            let _slot = RunningSlot(running);
            peak.fetch_max(now, Ordering::SeqCst);

            let progress = LoggingProgress { chunk };
            let result = diarizer.diarize(&audio, device, &progress);
            completed.fetch_add(1, Ordering::SeqCst);
            result.map_err(|e| PipelineError::inference("diarize", e))
        })
        .await
    }
}

/// Block until this process holds the exclusive lock on `path`. The lock is
/// released when the returned file is dropped.
async fn lock_exclusive(path: PathBuf) -> Result<Option<File>> {
    tokio::task::spawn_blocking(move || -> Result<Option<File>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.lock()?;
        Ok(Some(file))
    })
    .await
    .map_err(|e| PipelineError::inference("diarize", e))?
}

/// Forwards collaborator progress to debug logs
struct LoggingProgress {
    chunk: String,
}

impl DiarizationProgress for LoggingProgress {
    fn report(&self, step: &str, completed: u64, total: Option<u64>) {
        match total {
            Some(total) => debug!("{}: diarization {} ({}/{})", self.chunk, step, completed, total),
            None => debug!("{}: diarization {} ({})", self.chunk, step, completed),
        }
    }
}

/// Whether a segment survives the minimum duration filter; 0 keeps everything
pub fn keep_segment(duration: f64, min_duration: f64) -> bool {
    min_duration <= 0.0 || duration >= min_duration
}

/// Turn raw diarizer output for one chunk into filtered speaker segments.
/// Turn times are relative to `source`; the chunk's timeline maps them back
/// onto the recording.
pub fn speaker_segments(
    turns: &[SpeakerTurn],
    chunk: &Chunk,
    source: &Path,
    min_duration: f64,
) -> Vec<SpeakerSegment> {
    let mut segments: Vec<SpeakerSegment> = turns
        .iter()
        .filter(|t| keep_segment(t.duration(), min_duration))
        .map(|t| {
            let start = t.start.max(0.0);
            let end = t.end.max(start);
            SpeakerSegment {
                label: t.label.clone(),
                start,
                end,
                timeline_start: chunk.timeline.start_at(start),
                timeline_end: chunk.timeline.end_at(end),
                chunk_index: chunk.index,
                chunk_offset: chunk.start,
                source: source.to_path_buf(),
            }
        })
        .collect();
    segments.sort_by(|a, b| a.start.total_cmp(&b.start));
    segments
}

/// Speaker output of one chunk
#[derive(Debug, Clone)]
pub struct ChunkDiarization {
    pub segments: Vec<SpeakerSegment>,
    pub speaker_files: Vec<PathBuf>,
    pub rttm: PathBuf,
}

/// Filter a chunk's turns and write per-speaker sub-artifacts, metadata and
/// a chunk RTTM next to the diarized audio.
pub fn record_speakers(
    media: &dyn MediaTool,
    chunk: &Chunk,
    audio: &Path,
    turns: &[SpeakerTurn],
    min_duration: f64,
    output_dir: &Path,
) -> Result<ChunkDiarization> {
    let segments = speaker_segments(turns, chunk, audio, min_duration);
    let dropped = turns.len() - segments.len();
    let stem = file_stem(audio);

    let mut by_label: BTreeMap<String, Vec<&SpeakerSegment>> = BTreeMap::new();
    for segment in &segments {
        by_label
            .entry(normalize_label(&segment.label))
            .or_default()
            .push(segment);
    }

    let mut speaker_files = Vec::new();
    for (label, group) in &by_label {
        let dir = output_dir.join(label);
        fs::create_dir_all(&dir)?;

        let owned: Vec<SpeakerSegment> = group.iter().map(|s| (*s).clone()).collect();
        fs::write(
            dir.join(format!("metadata_{}.txt", stem)),
            chunk_speaker_metadata(label, chunk, &owned),
        )?;

        let clips: Vec<ClipSpec> = group
            .iter()
            .map(|s| ClipSpec::new(audio, s.start, s.end))
            .collect();
        let file = dir.join(format!("{}_{}.wav", label, stem));
        match media.concat(&clips, &file) {
            Ok(()) => speaker_files.push(file),
            Err(e) => warn!("{}: failed to write {} audio: {}", chunk.label(), label, e),
        }
    }

    let rttm = output_dir.join(format!("{}_diarization.rttm", stem));
    let entries: Vec<RttmEntry> = segments
        .iter()
        .map(|s| RttmEntry {
            start: s.start,
            duration: s.duration(),
            speaker: s.label.clone(),
        })
        .collect();
    write_rttm(&rttm, &stem, &entries)?;

    info!(
        "{}: {} speakers, {} segments kept, {} below {:.2}s dropped",
        chunk.label(),
        by_label.len(),
        segments.len(),
        dropped,
        min_duration
    );

    Ok(ChunkDiarization {
        segments,
        speaker_files,
        rttm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::media::WavMediaTool;
    use crate::models::Timeline;
    use crate::test_support::{turn, write_tone, ScriptedDiarizer};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_calls_never_overlap() {
        let diarizer = Arc::new(
            ScriptedDiarizer::new(vec![turn("A", 0.0, 1.0)]).with_delay(Duration::from_millis(40)),
        );
        let coordinator = Arc::new(DiarizationCoordinator::new());

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..5 {
            let coordinator = coordinator.clone();
            let diarizer: Arc<dyn Diarizer> = diarizer.clone();
            tasks.spawn(async move {
                coordinator
                    .diarize(
                        diarizer,
                        PathBuf::from("chunk.wav"),
                        Device::Host,
                        format!("chunk_{:04}", i + 1),
                        Duration::from_secs(10),
                    )
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap().len(), 1);
        }

        assert_eq!(diarizer.peak(), 1);
        assert_eq!(coordinator.peak_running(), 1);
        assert_eq!(coordinator.completed(), 5);
        assert_eq!(coordinator.state(), DiarizationState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lock_file_excludes_other_coordinators() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("diarization.lock");
        let diarizer = Arc::new(
            ScriptedDiarizer::new(vec![turn("A", 0.0, 1.0)]).with_delay(Duration::from_millis(40)),
        );

        // Separate coordinators stand in for separate worker processes
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..3 {
            let coordinator = DiarizationCoordinator::with_lock_file(&lock);
            let diarizer: Arc<dyn Diarizer> = diarizer.clone();
            tasks.spawn(async move {
                coordinator
                    .diarize(
                        diarizer,
                        PathBuf::from("chunk.wav"),
                        Device::Host,
                        format!("chunk_{:04}", i + 1),
                        Duration::from_secs(10),
                    )
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap().is_ok());
        }

        assert_eq!(diarizer.calls(), 3);
        assert_eq!(diarizer.peak(), 1);
        assert!(lock.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_keeps_lock_until_call_returns() {
        let diarizer = Arc::new(
            ScriptedDiarizer::new(Vec::new()).with_delay(Duration::from_millis(200)),
        );
        let coordinator = DiarizationCoordinator::new();

        let first = coordinator
            .diarize(
                diarizer.clone(),
                PathBuf::from("a.wav"),
                Device::Host,
                "chunk_0001".to_string(),
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(first, Err(PipelineError::Timeout { .. })));

        let second = coordinator
            .diarize(
                diarizer.clone(),
                PathBuf::from("b.wav"),
                Device::Host,
                "chunk_0002".to_string(),
                Duration::from_secs(10),
            )
            .await;
        assert!(second.is_ok());
        assert_eq!(diarizer.peak(), 1);
        assert_eq!(diarizer.calls(), 2);
    }

    #[tokio::test]
    async fn test_collaborator_error_is_inference_error() {
        let diarizer = Arc::new(ScriptedDiarizer::new(Vec::new()).failing());
        let coordinator = DiarizationCoordinator::new();
        let result = coordinator
            .diarize(
                diarizer,
                PathBuf::from("a.wav"),
                Device::Host,
                "chunk_0001".to_string(),
                Duration::from_secs(10),
            )
            .await;
        assert!(matches!(result, Err(PipelineError::Inference { .. })));
        assert_eq!(coordinator.state(), DiarizationState::Idle);
    }

    #[test]
    fn test_zero_threshold_keeps_every_segment() {
        let chunk = Chunk::new("job", 1, 600.0, 1200.0);
        let turns = vec![
            turn("A", 0.0, 0.3),
            turn("B", 1.0, 1.2),
            turn("A", 2.0, 5.0),
        ];
        let kept = speaker_segments(&turns, &chunk, Path::new("c.wav"), 0.0);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].chunk_offset, 600.0);
        assert_eq!(kept[0].chunk_index, 1);
    }

    #[test]
    fn test_threshold_drops_short_segments() {
        let chunk = Chunk::new("job", 0, 0.0, 600.0);
        let turns = vec![
            turn("A", 0.0, 1.49),
            turn("B", 3.0, 4.5),
            turn("A", 6.0, 9.0),
        ];
        let kept = speaker_segments(&turns, &chunk, Path::new("c.wav"), 1.5);
        let durations: Vec<f64> = kept.iter().map(SpeakerSegment::duration).collect();
        assert_eq!(durations, vec![1.5, 3.0]);
    }

    #[test]
    fn test_record_speakers_writes_sub_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("chunk_0001.wav");
        write_tone(&audio, 10.0, 8000);

        let chunk = Chunk::new("job", 0, 0.0, 10.0);
        let turns = vec![
            turn("SPEAKER_00", 0.0, 2.0),
            turn("SPEAKER_01", 2.5, 5.0),
            turn("SPEAKER_00", 6.0, 9.0),
            turn("SPEAKER_01", 9.2, 9.4),
        ];
        let out = record_speakers(&WavMediaTool, &chunk, &audio, &turns, 1.5, dir.path()).unwrap();

        assert_eq!(out.segments.len(), 3);
        assert_eq!(out.speaker_files.len(), 2);
        let speaker_00 = dir.path().join("speaker_00");
        assert!(speaker_00.join("speaker_00_chunk_0001.wav").exists());
        assert!(speaker_00.join("metadata_chunk_0001.txt").exists());

        let joined = crate::io::wav::wav_duration(&speaker_00.join("speaker_00_chunk_0001.wav")).unwrap();
        assert!((joined - 5.0).abs() < 1e-3);

        let rttm = fs::read_to_string(&out.rttm).unwrap();
        assert_eq!(rttm.lines().count(), 3);
    }

    #[test]
    fn test_segments_map_back_across_removed_silence() {
        let mut chunk = Chunk::new("job", 1, 600.0, 650.0);
        chunk.timeline = Timeline::from_spans([(30.0, 40.0), (44.0, 50.0)]);

        let turns = vec![turn("A", 0.0, 10.0), turn("B", 10.0, 12.0)];
        let kept = speaker_segments(&turns, &chunk, Path::new("c_nosilence.wav"), 0.0);

        assert_eq!(kept[0].start, 0.0);
        assert_eq!(kept[0].absolute_start(), 630.0);
        assert_eq!(kept[0].absolute_end(), 640.0);
        assert_eq!(kept[1].absolute_start(), 644.0);
        assert_eq!(kept[1].absolute_end(), 646.0);
        assert_eq!(kept[1].duration(), 2.0);
    }
}
