use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::pipeline::ChunkOutcome;
use super::stage3_diarize::keep_segment;
use crate::error::Result;
use crate::io::media::{ClipSpec, MediaTool};
use crate::models::{normalize_label, AudioJob, GroupMetadata, SpeakerGroup, SpeakerSegment};

#[derive(Debug, Clone, Serialize)]
pub struct AggregationFailure {
    pub label: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub groups: Vec<SpeakerGroup>,
    pub failures: Vec<AggregationFailure>,
}

/// Merges chunk-level speaker segments into one group per speaker label
pub struct SpeakerAggregator {
    media: Arc<dyn MediaTool>,
    min_duration: f64,
}

impl SpeakerAggregator {
    pub fn new(media: Arc<dyn MediaTool>, min_duration: f64) -> Self {
        Self {
            media,
            min_duration,
        }
    }

    /// Group the segments of every chunk of a job.
    ///
    /// Takes the complete outcome list, so nothing is emitted before all
    /// chunks finished. Groups come back sorted by normalized label; a
    /// group whose audio cannot be concatenated is reported and left out.
    pub fn aggregate(&self, job: &AudioJob, outcomes: &[ChunkOutcome], workdir: &Path) -> Aggregation {
        let mut by_label: BTreeMap<String, Vec<SpeakerSegment>> = BTreeMap::new();
        for outcome in outcomes {
            if !outcome.chunk.is_settled() {
                warn!(
                    "{}: {} has unfinished stages, ignoring its speakers",
                    job.name,
                    outcome.chunk.label()
                );
                continue;
            }
            for segment in &outcome.segments {
                if keep_segment(segment.duration(), self.min_duration) {
                    by_label
                        .entry(normalize_label(&segment.label))
                        .or_default()
                        .push(segment.clone());
                }
            }
        }

        let mut aggregation = Aggregation::default();
        for (label, mut segments) in by_label {
            segments.sort_by(|a, b| {
                a.absolute_start()
                    .total_cmp(&b.absolute_start())
                    .then(a.chunk_index.cmp(&b.chunk_index))
            });
            match self.build_group(job, &label, segments, workdir) {
                Ok(group) => aggregation.groups.push(group),
                Err(e) => {
                    warn!("{}: speaker {} could not be merged: {}", job.name, label, e);
                    aggregation.failures.push(AggregationFailure {
                        label,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            "{}: aggregated {} speaker groups ({} failed)",
            job.name,
            aggregation.groups.len(),
            aggregation.failures.len()
        );
        aggregation
    }

    fn build_group(
        &self,
        job: &AudioJob,
        label: &str,
        segments: Vec<SpeakerSegment>,
        workdir: &Path,
    ) -> Result<SpeakerGroup> {
        let clips: Vec<ClipSpec> = segments
            .iter()
            .map(|s| ClipSpec::new(&s.source, s.start, s.end))
            .collect();
        let artifact = workdir.join("speakers").join(format!("{}.wav", label));
        self.media.concat(&clips, &artifact)?;

        let metadata = GroupMetadata {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            label: label.to_string(),
            first_chunk: segments.iter().map(|s| s.chunk_index).min().unwrap_or(0),
            last_chunk: segments.iter().map(|s| s.chunk_index).max().unwrap_or(0),
            segment_count: segments.len(),
            total_duration: segments.iter().map(SpeakerSegment::duration).sum(),
        };

        Ok(SpeakerGroup {
            label: label.to_string(),
            segments,
            artifact,
            metadata,
        })
    }
}
