use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::run_blocking;
use super::stage1_denoise::denoise;
use super::stage2_silence::remove_silence;
use super::stage3_diarize::record_speakers;
use crate::config::{StageBudget, StageKind, StageSet};
use crate::error::{PipelineError, Result, StageError};
use crate::inference::{Device, ModelKind};
use crate::models::{Chunk, JobSettings, SpeakerSegment, StageResult, StageStatus, Timeline};
use crate::resources::{Admission, ResourceLease};
use crate::scheduler::RunContext;

/// Everything one chunk produced
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub chunk: Chunk,
    pub results: Vec<StageResult>,
    pub segments: Vec<SpeakerSegment>,
    /// Set when the chunk could not be extracted from its source
    pub error: Option<StageError>,
}

impl ChunkOutcome {
    pub fn extracted(&self) -> bool {
        self.error.is_none()
    }
}

/// What a stage produced besides its output artifact
#[derive(Default)]
struct Produced {
    segments: Vec<SpeakerSegment>,
    /// Replaces the chunk timeline when the stage shortened the audio
    timeline: Option<Timeline>,
}

/// Where an admitted stage runs, and the lease that admitted it
struct Placement {
    device: Device,
    status: StageStatus,
    _lease: Option<ResourceLease>,
}

/// Applies denoise, silence removal and diarize, in that order, to one chunk
pub struct StagePipeline {
    ctx: Arc<RunContext>,
    stages: StageSet,
    min_segment_secs: f64,
}

impl StagePipeline {
    pub fn new(ctx: Arc<RunContext>, settings: &JobSettings) -> Self {
        let stages = settings.stages.intersect(&ctx.stages);
        Self {
            ctx,
            stages,
            min_segment_secs: settings.min_speaker_segment_secs,
        }
    }

    pub fn stages(&self) -> StageSet {
        self.stages
    }

    /// Extract a chunk from `source` and run every stage on it.
    ///
    /// A failed stage passes its input through; the next stage runs on the
    /// last artifact that was produced. Only an extraction failure leaves
    /// the chunk without audio.
    pub async fn process(&self, source: &Path, mut chunk: Chunk, workdir: &Path) -> ChunkOutcome {
        let dir = workdir.join(chunk.label());
        let input = dir.join(format!("{}.wav", chunk.label()));

        if let Err(e) = self.extract(source, &chunk, &input).await {
            warn!("{}: extraction failed: {}", chunk.label(), e);
            chunk.mark_failed();
            return ChunkOutcome {
                chunk,
                results: Vec::new(),
                segments: Vec::new(),
                error: Some(StageError::from(&e)),
            };
        }
        chunk.artifact = Some(input.clone());

        let mut current = input;
        let mut results = Vec::with_capacity(StageKind::ORDER.len());
        let mut segments = Vec::new();
        for stage in StageKind::ORDER {
            let (result, produced) = self.run_stage(stage, &chunk, &current, &dir).await;
            chunk.record(&result);
            if let Some(timeline) = produced.timeline {
                chunk.timeline = timeline;
            }
            current = result.output.clone();
            segments.extend(produced.segments);
            results.push(result);
        }

        info!(
            "{}: finished [{}]",
            chunk.label(),
            results
                .iter()
                .map(|r| format!("{}={:?}", r.stage, r.status))
                .collect::<Vec<_>>()
                .join(", ")
        );

        ChunkOutcome {
            chunk,
            results,
            segments,
            error: None,
        }
    }

    async fn extract(&self, source: &Path, chunk: &Chunk, output: &Path) -> Result<()> {
        let media = self.ctx.media.clone();
        let source = source.to_path_buf();
        let output = output.to_path_buf();
        let (start, duration) = (chunk.start, chunk.duration());
        run_blocking("extract", self.ctx.config.boundary.analysis_timeout(), move || {
            media.extract(&source, start, duration, &output)
        })
        .await
    }

    async fn run_stage(
        &self,
        stage: StageKind,
        chunk: &Chunk,
        input: &Path,
        dir: &Path,
    ) -> (StageResult, Produced) {
        if !self.stages.contains(stage) {
            return (StageResult::skipped(stage, input), Produced::default());
        }

        let budget = self.ctx.config.budgets.get(stage);
        let placement = match self.place(stage, budget) {
            Ok(placement) => placement,
            Err(e) => {
                warn!("{} {}: {}, passing input through", chunk.label(), stage, e);
                return (StageResult::failed(stage, input, &e), Produced::default());
            }
        };

        let started = Instant::now();
        match self.invoke(stage, chunk, input, dir, placement.device, budget).await {
            Ok((output, produced)) => {
                debug!(
                    "{} {}: {:?} on {:?} in {:.1}s",
                    chunk.label(),
                    stage,
                    placement.status,
                    placement.device,
                    started.elapsed().as_secs_f64()
                );
                (
                    StageResult::completed(stage, placement.status, output),
                    produced,
                )
            }
            Err(e) => {
                warn!("{} {}: {}, passing input through", chunk.label(), stage, e);
                (StageResult::failed(stage, input, &e), Produced::default())
            }
        }
    }

    /// Admission control for one stage invocation
    fn place(&self, stage: StageKind, budget: &StageBudget) -> Result<Placement> {
        let resources = &self.ctx.resources;
        if !resources.has_accelerator() {
            return Ok(Placement {
                device: Device::Host,
                status: StageStatus::Done,
                _lease: None,
            });
        }

        match resources.admit(stage, budget.required_gb) {
            Admission::Granted(lease) => Ok(Placement {
                device: Device::Accelerator,
                status: StageStatus::Done,
                _lease: Some(lease),
            }),
            Admission::Denied { .. } if budget.host_fallback => {
                info!("{}: running on host after admission denial", stage);
                Ok(Placement {
                    device: Device::Host,
                    status: StageStatus::Fallback,
                    _lease: None,
                })
            }
            Admission::Denied { available_gb } => Err(PipelineError::TransientResource {
                stage: stage.to_string(),
                required_gb: budget.required_gb,
                available_gb,
            }),
        }
    }

    async fn invoke(
        &self,
        stage: StageKind,
        chunk: &Chunk,
        input: &Path,
        dir: &Path,
        device: Device,
        budget: &StageBudget,
    ) -> Result<(PathBuf, Produced)> {
        let model = self
            .ctx
            .models
            .get(ModelKind::for_stage(stage), self.ctx.config.variant(stage))
            .await?;
        let limit = budget.timeout();
        let input = input.to_path_buf();
        let dir = dir.to_path_buf();
        let collaborator_error = |e: anyhow::Error| PipelineError::inference(stage.as_str(), e);

        match stage {
            StageKind::Denoise => {
                let separator = model.separator().map_err(collaborator_error)?;
                let output = run_blocking(stage.as_str(), limit, move || {
                    denoise(separator.as_ref(), &input, &dir, device)
                })
                .await?;
                Ok((output, Produced::default()))
            }
            StageKind::SilenceRemoval => {
                let detector = model.voice_activity().map_err(collaborator_error)?;
                let settings = self.ctx.config.silence.clone();
                let removal = run_blocking(stage.as_str(), limit, move || {
                    remove_silence(detector.as_ref(), &input, &dir, device, &settings)
                })
                .await?;
                let timeline = (!removal.kept.is_empty())
                    .then(|| Timeline::from_spans(removal.kept.iter().map(|i| (i.start, i.end))));
                Ok((
                    removal.output,
                    Produced {
                        segments: Vec::new(),
                        timeline,
                    },
                ))
            }
            StageKind::Diarize => {
                let diarizer = model.diarizer().map_err(collaborator_error)?;
                let turns = self
                    .ctx
                    .diarization
                    .diarize(diarizer, input.clone(), device, chunk.label(), limit)
                    .await?;

                let media = self.ctx.media.clone();
                let chunk = chunk.clone();
                let min_duration = self.min_segment_secs;
                let audio = input.clone();
                let recorded = run_blocking(stage.as_str(), limit, move || {
                    record_speakers(media.as_ref(), &chunk, &audio, &turns, min_duration, &dir)
                })
                .await?;
                Ok((
                    input,
                    Produced {
                        segments: recorded.segments,
                        timeline: None,
                    },
                ))
            }
        }
    }
}
