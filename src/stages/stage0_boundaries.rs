//! Stage 0: cutting a job into chunks at natural speech boundaries.
//!
//! Every provisional cut point gets a window of audio around it analyzed
//! independently and in parallel. The candidates found are then merged by a
//! single sequential pass that keeps the cut points monotonic.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::run_blocking;
use crate::config::SplitMethod;
use crate::error::{PipelineError, Result};
use crate::inference::{ModelKind, Transcriber};
use crate::models::{AudioJob, Chunk, JobSettings};
use crate::scheduler::RunContext;

/// Chunks shorter than this are treated as empty
pub const BOUNDARY_EPSILON: f64 = 1e-6;

/// A detected speech end time, in seconds from the start of the job
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryCandidate {
    pub time: f64,
}

/// How the cut points of a plan were chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryMode {
    /// The whole recording is one chunk
    Single,
    /// Provisional targets used directly
    Fixed,
    /// Targets moved to nearby speech boundaries
    SpeechBoundary,
    /// Boundary analysis was unavailable, targets used directly
    FixedFallback,
}

#[derive(Debug, Clone)]
pub struct BoundaryPlan {
    pub chunks: Vec<Chunk>,
    pub mode: BoundaryMode,
    pub candidates: usize,
}

/// Provisional cut points `i * target` for `i = 1..ceil(total / target)`.
/// The end of the recording is never a target.
pub fn provisional_targets(total: f64, target: f64) -> Vec<f64> {
    if !(target > 0.0) || total <= target {
        return Vec::new();
    }
    let count = (total / target).ceil() as usize;
    (1..count)
        .map(|i| i as f64 * target)
        .filter(|&t| t < total)
        .collect()
}

/// Candidate closest to `target`; ties go to the earlier time
fn nearest(candidates: &[BoundaryCandidate], target: f64) -> Option<f64> {
    candidates
        .iter()
        .map(|c| c.time)
        .filter(|t| t.is_finite())
        .min_by(|a, b| {
            (a - target)
                .abs()
                .total_cmp(&(b - target).abs())
                .then(a.total_cmp(b))
        })
}

/// Sequential resolution pass.
///
/// `candidates[i]` belongs to `targets[i]`; a missing or empty entry means
/// the target itself is the cut. Produces a contiguous chunk list covering
/// `[0, total]`, dropping zero-length chunks.
pub fn resolve_boundaries(
    job_id: &str,
    total: f64,
    targets: &[f64],
    candidates: &[Vec<BoundaryCandidate>],
) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::with_capacity(targets.len() + 1);
    let mut cursor = 0.0;

    for (i, &target) in targets.iter().enumerate() {
        let best = candidates
            .get(i)
            .and_then(|c| nearest(c, target))
            .unwrap_or(target)
            .clamp(cursor, total);
        if best - cursor > BOUNDARY_EPSILON {
            chunks.push(Chunk::new(job_id, chunks.len(), cursor, best));
            cursor = best;
        }
    }

    if total - cursor > BOUNDARY_EPSILON {
        chunks.push(Chunk::new(job_id, chunks.len(), cursor, total));
    } else if let Some(last) = chunks.last_mut() {
        last.end = total;
    }
    chunks
}

/// Plans the chunks of a job
pub struct BoundaryCoordinator {
    ctx: Arc<RunContext>,
}

impl BoundaryCoordinator {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    pub async fn plan(
        &self,
        job: &AudioJob,
        total: f64,
        settings: &JobSettings,
        workdir: &Path,
    ) -> Result<BoundaryPlan> {
        if !(total.is_finite() && total > 0.0) {
            return Err(PipelineError::CatastrophicJob {
                job: job.name.clone(),
                reason: format!("cannot split audio of duration {}", total),
            });
        }

        let target = settings.target_chunk_secs;
        let targets = provisional_targets(total, target);
        if targets.is_empty() || settings.split == SplitMethod::Whole {
            return Ok(BoundaryPlan {
                chunks: vec![Chunk::new(&job.id, 0, 0.0, total)],
                mode: BoundaryMode::Single,
                candidates: 0,
            });
        }

        if settings.split == SplitMethod::FixedDuration {
            return Ok(BoundaryPlan {
                chunks: resolve_boundaries(&job.id, total, &targets, &[]),
                mode: BoundaryMode::Fixed,
                candidates: 0,
            });
        }

        match self.analyze(job, total, &targets, workdir).await {
            Ok(candidates) => {
                let found = candidates.iter().map(Vec::len).sum();
                let chunks = resolve_boundaries(&job.id, total, &targets, &candidates);
                info!(
                    "{}: {} chunks from {} targets ({} boundary candidates)",
                    job.name,
                    chunks.len(),
                    targets.len(),
                    found
                );
                Ok(BoundaryPlan {
                    chunks,
                    mode: BoundaryMode::SpeechBoundary,
                    candidates: found,
                })
            }
            Err(e) => {
                warn!("{}: {}, using fixed-duration splits", job.name, e);
                Ok(BoundaryPlan {
                    chunks: resolve_boundaries(&job.id, total, &targets, &[]),
                    mode: BoundaryMode::FixedFallback,
                    candidates: 0,
                })
            }
        }
    }

    /// Analyze every target window; the result is indexed like `targets`.
    ///
    /// Fails only when boundary analysis is unavailable for the whole job.
    /// A single window that fails contributes no candidates.
    async fn analyze(
        &self,
        job: &AudioJob,
        total: f64,
        targets: &[f64],
        workdir: &Path,
    ) -> Result<Vec<Vec<BoundaryCandidate>>> {
        let transcriber = self
            .ctx
            .models
            .get(ModelKind::Transcription, &self.ctx.config.models.transcription)
            .await
            .and_then(|handle| {
                handle
                    .transcriber()
                    .map_err(|e| PipelineError::inference("transcription", e))
            })
            .map_err(|e| PipelineError::BoundaryResolution(e.to_string()))?;

        let windows = workdir.join("boundaries");
        let permits = Arc::new(Semaphore::new(self.ctx.pool_size.max(1)));
        let mut tasks = JoinSet::new();

        for (index, &target) in targets.iter().enumerate() {
            let half = self.ctx.config.boundary.search_window_secs;
            let window = AnalysisWindow {
                index,
                start: (target - half).max(0.0),
                end: (target + half).min(total),
                path: windows.join(format!("window_{:04}.wav", index + 1)),
            };
            let ctx = self.ctx.clone();
            let transcriber = transcriber.clone();
            let source = job.source.clone();
            let permits = permits.clone();

            tasks.spawn(async move {
                let result = analyze_window(&ctx, transcriber, &source, &window, permits).await;
                let _ = std::fs::remove_file(&window.path);
                (window.index, result)
            });
        }

        let mut candidates = vec![Vec::new(); targets.len()];
        let mut failures = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(found))) => candidates[index] = found,
                Ok((index, Err(e))) => {
                    failures += 1;
                    warn!("{}: boundary window {} failed: {}", job.name, index + 1, e);
                }
                Err(e) => {
                    failures += 1;
                    warn!("{}: boundary task failed: {}", job.name, e);
                }
            }
        }

        if failures == targets.len() {
            return Err(PipelineError::BoundaryResolution(
                "every analysis window failed".to_string(),
            ));
        }
        Ok(candidates)
    }
}

struct AnalysisWindow {
    index: usize,
    start: f64,
    end: f64,
    path: PathBuf,
}

/// Extract one window (bounded by the pool) and transcribe it (serialized
/// by the transcription gate)
async fn analyze_window(
    ctx: &RunContext,
    transcriber: Arc<dyn Transcriber>,
    source: &Path,
    window: &AnalysisWindow,
    permits: Arc<Semaphore>,
) -> Result<Vec<BoundaryCandidate>> {
    let limit = ctx.config.boundary.analysis_timeout();
    {
        let _permit = permits
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::BoundaryResolution(e.to_string()))?;
        let media = ctx.media.clone();
        let (input, output) = (source.to_path_buf(), window.path.clone());
        let (start, duration) = (window.start, window.end - window.start);
        run_blocking("boundary extraction", limit, move || {
            media.extract(&input, start, duration, &output)
        })
        .await?;
    }

    let gate = ctx.transcription_gate.clone().lock_owned().await;
    let path = window.path.clone();
    let segments = run_blocking("transcription", limit, move || {
        let _gate = gate;
        transcriber
            .transcribe(&path)
            .map_err(|e| PipelineError::inference("transcription", e))
    })
    .await?;

    let found: Vec<BoundaryCandidate> = segments
        .iter()
        .map(|s| window.start + s.end)
        .filter(|t| t.is_finite() && *t >= window.start && *t <= window.end)
        .map(|time| BoundaryCandidate { time })
        .collect();
    debug!(
        "Boundary window {} [{:.1}, {:.1}]: {} candidates",
        window.index + 1,
        window.start,
        window.end,
        found.len()
    );
    Ok(found)
}
