use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One diarized interval of a chunk's artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerSegment {
    /// Chunk-local label as reported by the diarizer
    pub label: String,
    /// Start in seconds, relative to `source`
    pub start: f64,
    /// End in seconds, relative to `source`
    pub end: f64,
    /// Start on the chunk's source timeline, before any silence was cut
    pub timeline_start: f64,
    /// End on the chunk's source timeline
    pub timeline_end: f64,
    pub chunk_index: usize,
    /// Start of the owning chunk on the job timeline
    pub chunk_offset: f64,
    /// Artifact the interval refers to
    pub source: PathBuf,
}

impl SpeakerSegment {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn absolute_start(&self) -> f64 {
        self.chunk_offset + self.timeline_start
    }

    pub fn absolute_end(&self) -> f64 {
        self.chunk_offset + self.timeline_end
    }
}

/// Canonical form of a diarizer label: trimmed, lowercase, and safe to use
/// in file names. Labels differing only in case or punctuation merge.
pub fn normalize_label(label: &str) -> String {
    let normalized: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

/// Accumulated metadata of a speaker group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub job_id: String,
    pub job_name: String,
    /// Normalized label shared by every segment of the group
    pub label: String,
    /// First and last chunk index contributing segments
    pub first_chunk: usize,
    pub last_chunk: usize,
    pub segment_count: usize,
    /// Sum of segment durations in seconds
    pub total_duration: f64,
}

/// All segments sharing a normalized label across a job's chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerGroup {
    pub label: String,
    /// Segments ordered by absolute start time
    pub segments: Vec<SpeakerSegment>,
    /// Concatenated audio of every segment
    pub artifact: PathBuf,
    pub metadata: GroupMetadata,
}
