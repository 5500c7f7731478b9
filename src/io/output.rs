use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{AudioJob, Chunk, SpeakerGroup, SpeakerSegment};
use crate::resources::lock;

/// One line of an RTTM diarization file
#[derive(Debug, Clone, PartialEq)]
pub struct RttmEntry {
    pub start: f64,
    pub duration: f64,
    pub speaker: String,
}

/// Format RTTM `SPEAKER` lines for one recording
pub fn format_rttm(file_id: &str, entries: &[RttmEntry]) -> String {
    let mut output = String::new();
    for entry in entries {
        let _ = writeln!(
            output,
            "SPEAKER {} 1 {:.3} {:.3} <NA> <NA> {} <NA> <NA>",
            file_id, entry.start, entry.duration, entry.speaker
        );
    }
    output
}

pub fn write_rttm(path: &Path, file_id: &str, entries: &[RttmEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format_rttm(file_id, entries))?;
    Ok(())
}

/// Metadata record for one speaker within one chunk
pub fn chunk_speaker_metadata(label: &str, chunk: &Chunk, segments: &[SpeakerSegment]) -> String {
    let total: f64 = segments.iter().map(SpeakerSegment::duration).sum();
    let mut output = String::new();
    let _ = writeln!(output, "Speaker: {}", label);
    let _ = writeln!(output, "Chunk: {}", chunk.index + 1);
    let _ = writeln!(
        output,
        "Chunk range: {} - {}",
        format_timestamp(chunk.start),
        format_timestamp(chunk.end)
    );
    let _ = writeln!(output, "Segments: {}", segments.len());
    let _ = writeln!(output, "Total duration: {:.2}s", total);
    output.push('\n');
    for segment in segments {
        let _ = writeln!(
            output,
            "{} - {} ({:.2}s)",
            format_timestamp(segment.absolute_start()),
            format_timestamp(segment.absolute_end()),
            segment.duration()
        );
    }
    output
}

/// Metadata record for one organized speaker group
pub fn group_metadata(speaker_id: &str, group: &SpeakerGroup) -> String {
    let meta = &group.metadata;
    let mut output = String::new();
    let _ = writeln!(output, "Speaker: {}", speaker_id);
    let _ = writeln!(output, "Diarization label: {}", meta.label);
    let _ = writeln!(output, "Source job: {} ({})", meta.job_name, meta.job_id);
    let _ = writeln!(
        output,
        "Chunks: {} - {}",
        meta.first_chunk + 1,
        meta.last_chunk + 1
    );
    let _ = writeln!(output, "Segments: {}", meta.segment_count);
    let _ = writeln!(output, "Total duration: {:.2}s", meta.total_duration);
    output.push('\n');
    for segment in &group.segments {
        let _ = writeln!(
            output,
            "chunk {:04}  {} - {} ({:.2}s)",
            segment.chunk_index + 1,
            format_timestamp(segment.absolute_start()),
            format_timestamp(segment.absolute_end()),
            segment.duration()
        );
    }
    output
}

/// Write any serializable value as pretty JSON
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(path)?;
    serde_json::to_writer_pretty(file, value).map_err(std::io::Error::other)?;
    Ok(())
}

/// Format seconds as HH:MM:SS.mmm
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let millis = total_ms % 1000;
    let secs = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        millis
    )
}

/// A speaker persisted into the output tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizedSpeaker {
    pub id: String,
    pub label: String,
    pub artifact: PathBuf,
    pub metadata: PathBuf,
    pub segment_count: usize,
    pub total_duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizeFailure {
    pub label: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrganizeReport {
    pub job_dir: PathBuf,
    pub speakers: Vec<OrganizedSpeaker>,
    pub rttm: Option<PathBuf>,
    pub chunk_files: Vec<PathBuf>,
    pub failures: Vec<OrganizeFailure>,
}

/// `speaker_` followed by four digits
fn is_speaker_dir(name: &str) -> bool {
    name.strip_prefix("speaker_")
        .is_some_and(|id| id.len() == 4 && id.bytes().all(|b| b.is_ascii_digit()))
}

/// Sole writer of the final output tree
#[derive(Debug)]
pub struct OutputOrganizer {
    root: PathBuf,
    /// Job directory names handed out during this run
    reserved: Mutex<HashSet<String>>,
}

impl OutputOrganizer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Claim a job directory no other job of this run uses.
    ///
    /// The first job named `talk` gets `<root>/talk`, later ones get
    /// `talk_2`, `talk_3` and so on.
    pub fn reserve(&self, job: &AudioJob) -> PathBuf {
        let mut reserved = lock(&self.reserved);
        let mut name = job.name.clone();
        let mut n = 1;
        while reserved.contains(&name) {
            n += 1;
            name = format!("{}_{}", job.name, n);
        }
        reserved.insert(name.clone());
        self.root.join(name)
    }

    /// Remove speaker folders, chunk copies and RTTM files an earlier run
    /// left in `job_dir`
    fn clear_stale(&self, job_dir: &Path) -> Result<()> {
        let entries = match fs::read_dir(job_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                if is_speaker_dir(&name) || name == "chunks" {
                    debug!("Removing stale {:?}", path);
                    fs::remove_dir_all(&path)?;
                }
            } else if name.ends_with("_diarization.rttm") {
                debug!("Removing stale {:?}", path);
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Persist a job's speaker groups, or its chunk artifacts when no
    /// speakers were produced.
    ///
    /// Speakers get sequential ids in the order given. A failure for one
    /// speaker is recorded and the rest are still written.
    pub fn organize(
        &self,
        job: &AudioJob,
        job_dir: &Path,
        groups: &[SpeakerGroup],
        chunks: &[Chunk],
    ) -> Result<OrganizeReport> {
        self.clear_stale(job_dir)?;
        fs::create_dir_all(job_dir)?;

        let mut report = OrganizeReport {
            job_dir: job_dir.to_path_buf(),
            ..Default::default()
        };

        let mut rttm = Vec::new();
        for (i, group) in groups.iter().enumerate() {
            let id = format!("speaker_{:04}", i + 1);
            match self.write_speaker(job_dir, &id, group) {
                Ok(speaker) => {
                    rttm.extend(group.segments.iter().map(|s| RttmEntry {
                        start: s.absolute_start(),
                        duration: s.absolute_end() - s.absolute_start(),
                        speaker: id.clone(),
                    }));
                    report.speakers.push(speaker);
                }
                Err(e) => {
                    warn!("{}: failed to organize {} ({}): {}", job.name, id, group.label, e);
                    report.failures.push(OrganizeFailure {
                        label: group.label.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if !rttm.is_empty() {
            rttm.sort_by(|a, b| a.start.total_cmp(&b.start));
            let path = job_dir.join(format!("{}_diarization.rttm", job.name));
            write_rttm(&path, &job.name, &rttm)?;
            report.rttm = Some(path);
        }

        if groups.is_empty() {
            report.chunk_files = self.copy_chunks(job_dir, job, chunks);
        }

        info!(
            "{}: organized {} speakers, {} chunk files into {:?}",
            job.name,
            report.speakers.len(),
            report.chunk_files.len(),
            job_dir
        );
        Ok(report)
    }

    fn write_speaker(
        &self,
        job_dir: &Path,
        id: &str,
        group: &SpeakerGroup,
    ) -> Result<OrganizedSpeaker> {
        let dir = job_dir.join(id);
        fs::create_dir_all(&dir)?;

        let artifact = dir.join(format!("{}.wav", id));
        fs::copy(&group.artifact, &artifact)?;

        let metadata = dir.join("metadata.txt");
        fs::write(&metadata, group_metadata(id, group))?;

        Ok(OrganizedSpeaker {
            id: id.to_string(),
            label: group.label.clone(),
            artifact,
            metadata,
            segment_count: group.metadata.segment_count,
            total_duration: group.metadata.total_duration,
        })
    }

    fn copy_chunks(&self, job_dir: &Path, job: &AudioJob, chunks: &[Chunk]) -> Vec<PathBuf> {
        let dir = job_dir.join("chunks");
        let mut copied = Vec::new();
        for chunk in chunks {
            let Some(artifact) = &chunk.artifact else {
                continue;
            };
            let target = dir.join(format!("{}_{}.wav", job.name, chunk.label()));
            let result = fs::create_dir_all(&dir).and_then(|_| fs::copy(artifact, &target));
            match result {
                Ok(_) => copied.push(target),
                Err(e) => warn!("{}: failed to copy {}: {}", job.name, chunk.label(), e),
            }
        }
        copied
    }
}
