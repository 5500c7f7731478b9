use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::StageKind;
use crate::error::{PipelineError, StageError};

/// Per-stage progress of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    /// Not requested for this job
    Skipped,
    /// Ran on the preferred device
    Done,
    /// Ran on the non-accelerated path after admission was denied
    Fallback,
    /// Errored or timed out; the input artifact was passed through
    Failed,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Pending)
    }
}

/// A contiguous, non-overlapping time window of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub job_id: String,
    /// Zero-based position in the job's chunk list
    pub index: usize,
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    /// Current artifact; `None` until the chunk has been extracted
    pub artifact: Option<PathBuf>,
    pub stages: BTreeMap<StageKind, StageStatus>,
    /// How the current artifact's timeline relates to the chunk's source
    #[serde(default)]
    pub timeline: Timeline,
}

impl Chunk {
    pub fn new(job_id: impl Into<String>, index: usize, start: f64, end: f64) -> Self {
        Self {
            job_id: job_id.into(),
            index,
            start,
            end,
            artifact: None,
            stages: StageKind::ORDER
                .iter()
                .map(|s| (*s, StageStatus::Pending))
                .collect(),
            timeline: Timeline::default(),
        }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// File-name friendly label, one-based
    pub fn label(&self) -> String {
        format!("chunk_{:04}", self.index + 1)
    }

    pub fn status(&self, stage: StageKind) -> StageStatus {
        self.stages
            .get(&stage)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    pub fn record(&mut self, result: &StageResult) {
        self.stages.insert(result.stage, result.status);
        self.artifact = Some(result.output.clone());
    }

    /// Mark every unfinished stage failed, for chunks that never got audio
    pub fn mark_failed(&mut self) {
        for status in self.stages.values_mut() {
            if !status.is_terminal() {
                *status = StageStatus::Failed;
            }
        }
    }

    /// All stages have settled
    pub fn is_settled(&self) -> bool {
        self.stages.values().all(StageStatus::is_terminal)
    }
}

/// Maps positions in a shortened artifact back to the chunk's source.
///
/// Holds the source spans, in chunk-local seconds, that were concatenated
/// into the artifact. An empty timeline is the identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    spans: Vec<(f64, f64)>,
}

impl Timeline {
    pub fn from_spans(spans: impl IntoIterator<Item = (f64, f64)>) -> Self {
        Self {
            spans: spans.into_iter().filter(|(s, e)| e > s).collect(),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.spans.is_empty()
    }

    /// Source position of an artifact time where something starts. A time
    /// on a splice belongs to the following span.
    pub fn start_at(&self, t: f64) -> f64 {
        self.map(t, false)
    }

    /// Source position of an artifact time where something ends. A time on
    /// a splice belongs to the preceding span.
    pub fn end_at(&self, t: f64) -> f64 {
        self.map(t, true)
    }

    fn map(&self, t: f64, inclusive: bool) -> f64 {
        let Some(&(_, last_end)) = self.spans.last() else {
            return t;
        };
        let mut elapsed = 0.0;
        for &(start, end) in &self.spans {
            let length = end - start;
            let inside = if inclusive {
                t <= elapsed + length
            } else {
                t < elapsed + length
            };
            if inside {
                return start + (t - elapsed).max(0.0);
            }
            elapsed += length;
        }
        last_end
    }
}

/// Output of one stage applied to one chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub status: StageStatus,
    /// New artifact, or the unchanged input on skip/failure
    pub output: PathBuf,
    pub error: Option<StageError>,
}

impl StageResult {
    pub fn skipped(stage: StageKind, input: &Path) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            output: input.to_path_buf(),
            error: None,
        }
    }

    pub fn completed(stage: StageKind, status: StageStatus, output: PathBuf) -> Self {
        Self {
            stage,
            status,
            output,
            error: None,
        }
    }

    /// Pass the input through and keep the error for reporting
    pub fn failed(stage: StageKind, input: &Path, error: &PipelineError) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            output: input.to_path_buf(),
            error: Some(StageError::from(error)),
        }
    }

    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}
