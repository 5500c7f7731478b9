//! Top-level driver: jobs and their chunks on bounded worker pools.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ConcurrencyStrategy, PipelineConfig, StageKind, StageSet};
use crate::error::{PipelineError, Result, StageError};
use crate::inference::ModelLoader;
use crate::io::media::MediaTool;
use crate::io::output::{write_json, OrganizeFailure, OrganizedSpeaker, OutputOrganizer};
use crate::models::{AudioJob, Chunk, JobSettings, StageStatus};
use crate::resources::{Accelerator, ModelCache, ResourceManager, StaticAccelerator};
use crate::stages::{
    run_blocking, BoundaryCoordinator, BoundaryMode, BoundaryPlan, ChunkOutcome,
    DiarizationCoordinator, SpeakerAggregator, StagePipeline,
};
use crate::worker::{ProcessPool, WorkerCommand};

/// CPU and memory of the host, used to size worker pools
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostCapacity {
    pub cpus: usize,
    pub memory_gb: f64,
}

impl HostCapacity {
    pub fn detect() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_all();
        Self {
            cpus: system.cpus().len().max(1),
            memory_gb: system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
        }
    }

    /// Workers the host can sustain for this workload
    pub fn recommended_workers(&self) -> usize {
        let half = self.cpus / 2;
        let workers = if self.cpus >= 12 && self.memory_gb >= 24.0 {
            half.min(6)
        } else if self.cpus >= 8 && self.memory_gb >= 16.0 {
            half.min(4)
        } else {
            half.min(2)
        };
        workers.max(1)
    }
}

/// Pool size for a strategy: configured workers capped by the host
pub fn pool_size(strategy: &ConcurrencyStrategy, host: &HostCapacity) -> usize {
    match strategy {
        ConcurrencyStrategy::Sequential => 1,
        ConcurrencyStrategy::BoundedThread { max_workers }
        | ConcurrencyStrategy::BoundedProcess { max_workers } => {
            (*max_workers).min(host.recommended_workers()).max(1)
        }
    }
}

/// Shared state of one run, handed to every job and chunk worker
pub struct RunContext {
    pub config: PipelineConfig,
    /// Stages this run may execute at all
    pub stages: StageSet,
    pub pool_size: usize,
    pub resources: Arc<ResourceManager>,
    pub models: Arc<ModelCache>,
    pub diarization: Arc<DiarizationCoordinator>,
    pub media: Arc<dyn MediaTool>,
    /// Serializes calls into the transcription collaborator
    pub transcription_gate: Arc<Mutex<()>>,
}

impl RunContext {
    pub fn new(
        config: PipelineConfig,
        loader: Arc<dyn ModelLoader>,
        media: Arc<dyn MediaTool>,
        accelerator: Option<Arc<dyn Accelerator>>,
        pool_size: usize,
    ) -> Self {
        let resources = Arc::new(ResourceManager::new(
            accelerator,
            config.accelerator_budget_fraction,
        ));
        let models = Arc::new(ModelCache::new(
            loader,
            resources.clone(),
            config.diarization_credential.clone(),
        ));

        let has_credential = config
            .diarization_credential
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty());
        if !has_credential && config.stages.diarize {
            warn!("No diarization credential configured, diarization is disabled for this run");
        }

        Self {
            stages: StageSet::all().with(StageKind::Diarize, has_credential),
            pool_size: pool_size.max(1),
            resources,
            models,
            diarization: Arc::new(DiarizationCoordinator::new()),
            media,
            transcription_gate: Arc::new(Mutex::new(())),
            config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkReport {
    pub index: usize,
    pub start: f64,
    pub end: f64,
    pub stages: BTreeMap<StageKind, StageStatus>,
    pub errors: Vec<StageError>,
    pub segments: usize,
}

impl From<&ChunkOutcome> for ChunkReport {
    fn from(outcome: &ChunkOutcome) -> Self {
        let errors = outcome
            .error
            .iter()
            .cloned()
            .chain(outcome.results.iter().filter_map(|r| r.error.clone()))
            .collect();
        Self {
            index: outcome.chunk.index,
            start: outcome.chunk.start,
            end: outcome.chunk.end,
            stages: outcome.chunk.stages.clone(),
            errors,
            segments: outcome.segments.len(),
        }
    }
}

/// Summary of one job, also written as `summary.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub job_name: String,
    pub source: PathBuf,
    pub status: JobStatus,
    pub error: Option<StageError>,
    pub duration: Option<f64>,
    pub boundary_mode: Option<BoundaryMode>,
    pub chunks: Vec<ChunkReport>,
    pub speakers: Vec<OrganizedSpeaker>,
    pub speaker_failures: Vec<OrganizeFailure>,
    pub output_dir: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    fn new(job: &AudioJob) -> Self {
        let now = Utc::now();
        Self {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            source: job.source.clone(),
            status: JobStatus::Failed,
            error: None,
            duration: job.duration,
            boundary_mode: None,
            chunks: Vec::new(),
            speakers: Vec::new(),
            speaker_failures: Vec::new(),
            output_dir: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub(crate) fn failed(job: &AudioJob, error: &PipelineError) -> Self {
        let mut report = Self::new(job);
        report.error = Some(StageError::from(error));
        report
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub pool_size: usize,
    pub jobs: Vec<JobReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.jobs.len() - self.completed()
    }
}

pub struct Scheduler {
    ctx: Arc<RunContext>,
    organizer: Arc<OutputOrganizer>,
    /// Set when jobs run in worker processes
    worker: Option<WorkerCommand>,
}

impl Scheduler {
    /// Build a scheduler for `config`, sizing pools from the host
    pub fn new(
        config: PipelineConfig,
        loader: Arc<dyn ModelLoader>,
        media: Arc<dyn MediaTool>,
    ) -> Result<Self> {
        config.validate()?;

        let host = HostCapacity::detect();
        let workers = pool_size(&config.concurrency, &host);
        info!(
            "Host: {} CPUs, {:.1}GB RAM -> {} workers ({:?})",
            host.cpus, host.memory_gb, workers, config.concurrency
        );
        let worker = match config.concurrency {
            ConcurrencyStrategy::BoundedProcess { .. } => Some(WorkerCommand::current_exe()?),
            _ => None,
        };

        let accelerator = config
            .accelerator_memory_gb
            .map(|gb| Arc::new(StaticAccelerator::new("accelerator", gb)) as Arc<dyn Accelerator>);

        let scheduler = Self::from_context(Arc::new(RunContext::new(
            config,
            loader,
            media,
            accelerator,
            workers,
        )));
        Ok(match worker {
            Some(worker) => scheduler.with_worker(worker),
            None => scheduler,
        })
    }

    /// Scheduler running every job in-process on `ctx`
    pub fn from_context(ctx: Arc<RunContext>) -> Self {
        let organizer = Arc::new(OutputOrganizer::new(ctx.config.output_dir.clone()));
        Self {
            ctx,
            organizer,
            worker: None,
        }
    }

    /// Run each job in its own process started by `worker`
    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    /// Process a batch of jobs, then tear down the model cache.
    ///
    /// Reports come back in submission order. A failed job never affects
    /// its siblings.
    pub async fn run(&self, jobs: Vec<AudioJob>) -> BatchReport {
        let started_at = Utc::now();
        info!(
            "Processing {} jobs with {} workers",
            jobs.len(),
            self.ctx.pool_size
        );

        let processes = match &self.worker {
            Some(worker) => match ProcessPool::new(worker.clone(), &self.ctx) {
                Ok(pool) => Some(Arc::new(pool)),
                Err(e) => {
                    error!("Cannot prepare worker processes: {}", e);
                    return BatchReport {
                        pool_size: self.ctx.pool_size,
                        jobs: jobs.iter().map(|job| JobReport::failed(job, &e)).collect(),
                        started_at,
                        finished_at: Utc::now(),
                    };
                }
            },
            None => None,
        };

        let permits = Arc::new(Semaphore::new(self.ctx.pool_size));
        let mut handles: Vec<(AudioJob, JoinHandle<JobReport>)> = Vec::with_capacity(jobs.len());
        for job in jobs {
            // Reserved in submission order so same-named jobs get stable suffixes
            let job_dir = self.organizer.reserve(&job);
            let ctx = self.ctx.clone();
            let organizer = self.organizer.clone();
            let processes = processes.clone();
            let permits = permits.clone();
            let task_job = job.clone();
            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                match processes {
                    Some(pool) => pool.run(task_job, job_dir).await,
                    None => run_job(&ctx, &organizer, task_job, job_dir).await,
                }
            });
            handles.push((job, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (job, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!("{}: job task aborted: {}", job.name, e);
                    JobReport::failed(&job, &PipelineError::CatastrophicJob {
                        job: job.name.clone(),
                        reason: e.to_string(),
                    })
                }
            };
            reports.push(report);
        }

        self.ctx.models.teardown().await;

        let batch = BatchReport {
            pool_size: self.ctx.pool_size,
            jobs: reports,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            "Batch finished: {} completed, {} failed",
            batch.completed(),
            batch.failed()
        );
        batch
    }

    /// Resolve a job's chunk plan without running any stage
    pub async fn plan(&self, job: &AudioJob) -> Result<BoundaryPlan> {
        let workspace = workspace(&self.ctx.config)?;
        let total = job_duration(&self.ctx, job).await?;
        let settings = job.settings_or(&self.ctx.config);
        BoundaryCoordinator::new(self.ctx.clone())
            .plan(job, total, &settings, workspace.path())
            .await
    }
}

pub(crate) fn workspace(config: &PipelineConfig) -> Result<tempfile::TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("voxsplit-");
    let dir = match &config.temp_dir {
        Some(parent) => {
            std::fs::create_dir_all(parent)?;
            builder.tempdir_in(parent)?
        }
        None => builder.tempdir()?,
    };
    Ok(dir)
}

async fn job_duration(ctx: &RunContext, job: &AudioJob) -> Result<f64> {
    if let Some(duration) = job.duration {
        return Ok(duration);
    }
    let media = ctx.media.clone();
    let source = job.source.clone();
    run_blocking("probe", ctx.config.boundary.analysis_timeout(), move || {
        media.probe_duration(&source)
    })
    .await
    .map_err(|e| PipelineError::CatastrophicJob {
        job: job.name.clone(),
        reason: format!("duration unavailable: {}", e),
    })
}

/// Run one job into `job_dir` and write its `summary.json` there
pub(crate) async fn run_job(
    ctx: &Arc<RunContext>,
    organizer: &Arc<OutputOrganizer>,
    job: AudioJob,
    job_dir: PathBuf,
) -> JobReport {
    let mut report = JobReport::new(&job);
    info!("{}: starting ({:?})", job.name, job.source);

    match process_job(ctx, organizer, &job, job_dir, &mut report).await {
        Ok(()) => {
            report.status = JobStatus::Completed;
            info!(
                "{}: completed with {} speakers in {} chunks",
                job.name,
                report.speakers.len(),
                report.chunks.len()
            );
        }
        Err(e) => {
            error!("{}: {}", job.name, e);
            report.status = JobStatus::Failed;
            report.error = Some(StageError::from(&e));
        }
    }
    report.finished_at = Utc::now();

    if let Some(dir) = &report.output_dir {
        if let Err(e) = write_json(&dir.join("summary.json"), &report) {
            warn!("{}: failed to write summary: {}", job.name, e);
        }
    }
    report
}

/// Plan, run every chunk, then aggregate and organize once all chunks are
/// done. The job workspace is removed when this returns.
async fn process_job(
    ctx: &Arc<RunContext>,
    organizer: &Arc<OutputOrganizer>,
    job: &AudioJob,
    job_dir: PathBuf,
    report: &mut JobReport,
) -> Result<()> {
    let settings = job.settings_or(&ctx.config);
    let workspace = workspace(&ctx.config)?;

    let total = job_duration(ctx, job).await?;
    report.duration = Some(total);

    let plan = BoundaryCoordinator::new(ctx.clone())
        .plan(job, total, &settings, workspace.path())
        .await?;
    report.boundary_mode = Some(plan.mode);

    let outcomes = run_chunks(ctx, job, &settings, plan.chunks, workspace.path()).await;
    report.chunks = outcomes.iter().map(ChunkReport::from).collect();

    if !outcomes.iter().any(ChunkOutcome::extracted) {
        return Err(PipelineError::CatastrophicJob {
            job: job.name.clone(),
            reason: "no chunk could be extracted".to_string(),
        });
    }

    let aggregator = SpeakerAggregator::new(ctx.media.clone(), settings.min_speaker_segment_secs);
    let organizer = organizer.clone();
    let workdir = workspace.path().to_path_buf();
    let owned_job = job.clone();
    let (aggregation, organized) = tokio::task::spawn_blocking(move || {
        let aggregation = aggregator.aggregate(&owned_job, &outcomes, &workdir);
        let chunks: Vec<Chunk> = outcomes.into_iter().map(|o| o.chunk).collect();
        let organized = organizer.organize(&owned_job, &job_dir, &aggregation.groups, &chunks);
        (aggregation, organized)
    })
    .await
    .map_err(|e| PipelineError::CatastrophicJob {
        job: job.name.clone(),
        reason: format!("aggregation aborted: {}", e),
    })?;

    let organized = organized?;
    report.output_dir = Some(organized.job_dir);
    report.speakers = organized.speakers;
    report.speaker_failures = organized.failures;
    report
        .speaker_failures
        .extend(aggregation.failures.into_iter().map(|f| OrganizeFailure {
            label: f.label,
            message: f.message,
        }));
    Ok(())
}

/// Run every chunk of a job on the chunk pool and wait for all of them
async fn run_chunks(
    ctx: &Arc<RunContext>,
    job: &AudioJob,
    settings: &JobSettings,
    chunks: Vec<Chunk>,
    workdir: &Path,
) -> Vec<ChunkOutcome> {
    let pipeline = Arc::new(StagePipeline::new(ctx.clone(), settings));
    let permits = Arc::new(Semaphore::new(ctx.pool_size));
    info!(
        "{}: {} chunks, stages [{}]",
        job.name,
        chunks.len(),
        pipeline
            .stages()
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut handles = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let pipeline = pipeline.clone();
        let permits = permits.clone();
        let source = job.source.clone();
        let workdir = workdir.to_path_buf();
        let planned = chunk.clone();
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            pipeline.process(&source, chunk, &workdir).await
        });
        handles.push((planned, handle));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (mut planned, handle) in handles {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                error!("{}: {} aborted: {}", job.name, planned.label(), e);
                let error = PipelineError::CatastrophicJob {
                    job: job.name.clone(),
                    reason: format!("{} aborted: {}", planned.label(), e),
                };
                planned.mark_failed();
                outcomes.push(ChunkOutcome {
                    chunk: planned,
                    results: Vec::new(),
                    segments: Vec::new(),
                    error: Some(StageError::from(&error)),
                });
            }
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SplitMethod;
    use crate::inference::Diarizer;
    use crate::io::media::WavMediaTool;
    use crate::test_support::{run_context, turn, write_tone, CountingLoader, ScriptedDiarizer};
    use std::time::Duration;

    #[test]
    fn test_recommended_workers() {
        let host = |cpus, memory_gb| HostCapacity { cpus, memory_gb };
        assert_eq!(host(16, 32.0).recommended_workers(), 6);
        assert_eq!(host(32, 64.0).recommended_workers(), 6);
        assert_eq!(host(8, 16.0).recommended_workers(), 4);
        assert_eq!(host(12, 16.0).recommended_workers(), 4);
        assert_eq!(host(4, 8.0).recommended_workers(), 2);
        assert_eq!(host(1, 2.0).recommended_workers(), 1);
    }

    #[test]
    fn test_pool_size_caps_configured_workers() {
        let host = HostCapacity {
            cpus: 16,
            memory_gb: 32.0,
        };
        assert_eq!(pool_size(&ConcurrencyStrategy::Sequential, &host), 1);
        assert_eq!(
            pool_size(&ConcurrencyStrategy::BoundedThread { max_workers: 3 }, &host),
            3
        );
        assert_eq!(
            pool_size(&ConcurrencyStrategy::BoundedProcess { max_workers: 10 }, &host),
            6
        );
    }

    fn config(output: &Path) -> PipelineConfig {
        PipelineConfig {
            target_chunk_secs: 10.0,
            split: SplitMethod::FixedDuration,
            output_dir: output.to_path_buf(),
            diarization_credential: Some("token".to_string()),
            ..Default::default()
        }
    }

    fn diarizer() -> Arc<ScriptedDiarizer> {
        Arc::new(
            ScriptedDiarizer::new(vec![
                turn("SPEAKER_00", 0.0, 2.0),
                turn("SPEAKER_01", 2.5, 4.5),
                turn("SPEAKER_00", 4.6, 4.9),
            ])
            .with_delay(Duration::from_millis(30)),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_job_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("interview.wav");
        write_tone(&source, 25.0, 1000);

        let out = dir.path().join("out");
        let loader = CountingLoader::new().with_diarizer(diarizer());
        let scheduler = Scheduler::from_context(run_context(config(&out), Arc::new(loader), None));
        let batch = scheduler.run(vec![AudioJob::new(&source)]).await;

        let report = &batch.jobs[0];
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.boundary_mode, Some(BoundaryMode::Fixed));
        assert_eq!(report.chunks.len(), 3);
        assert_eq!(report.speakers.len(), 2);
        // Two 2s turns per chunk survive the 1.5s filter, the 0.3s one does not
        assert_eq!(report.speakers[0].segment_count, 3);
        assert!((report.speakers[0].total_duration - 6.0).abs() < 1e-9);

        let job_dir = out.join("interview");
        assert!(job_dir.join("speaker_0001/speaker_0001.wav").exists());
        assert!(job_dir.join("speaker_0002/metadata.txt").exists());
        assert!(job_dir.join("interview_diarization.rttm").exists());
        let summary = std::fs::read_to_string(job_dir.join("summary.json")).unwrap();
        assert!(summary.contains("\"status\": \"completed\""));
        assert_eq!(scheduler.context().models.loaded(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_diarization_never_runs_twice_at_once() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        write_tone(&a, 25.0, 1000);
        write_tone(&b, 25.0, 1000);

        let diarizer = diarizer();
        let loader = CountingLoader::new().with_diarizer(diarizer.clone() as Arc<dyn Diarizer>);
        let ctx = run_context(config(&dir.path().join("out")), Arc::new(loader), None);
        assert_eq!(ctx.pool_size, 2);

        let scheduler = Scheduler::from_context(ctx.clone());
        let batch = scheduler.run(vec![AudioJob::new(&a), AudioJob::new(&b)]).await;

        assert_eq!(batch.completed(), 2);
        assert_eq!(diarizer.calls(), 6);
        assert_eq!(diarizer.peak(), 1);
        assert_eq!(ctx.diarization.peak_running(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_same_named_sources_get_separate_outputs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        let first = dir.path().join("a/talk.wav");
        let second = dir.path().join("b/talk.wav");
        write_tone(&first, 12.0, 1000);
        write_tone(&second, 12.0, 1000);

        let out = dir.path().join("out");
        let loader = CountingLoader::new().with_diarizer(diarizer());
        let ctx = run_context(config(&out), Arc::new(loader), None);
        let jobs = vec![AudioJob::new(&first), AudioJob::new(&second)];
        let ids: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
        let batch = Scheduler::from_context(ctx).run(jobs).await;

        assert_eq!(batch.completed(), 2);
        assert_eq!(batch.jobs[0].output_dir, Some(out.join("talk")));
        assert_eq!(batch.jobs[1].output_dir, Some(out.join("talk_2")));
        for (name, id) in ["talk", "talk_2"].iter().zip(&ids) {
            let summary = std::fs::read_to_string(out.join(name).join("summary.json")).unwrap();
            let report: serde_json::Value = serde_json::from_str(&summary).unwrap();
            assert_eq!(report["job_id"], id.as_str());
            assert!(out.join(name).join("talk_diarization.rttm").exists());
        }
    }

    #[tokio::test]
    async fn test_rerun_replaces_previous_speakers() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("call.wav");
        write_tone(&source, 5.0, 1000);
        let out = dir.path().join("out");
        let stale = out.join("call/speaker_0007");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("metadata.txt"), "old").unwrap();

        let loader = CountingLoader::new()
            .with_diarizer(Arc::new(ScriptedDiarizer::new(vec![turn("SPEAKER_00", 0.0, 3.0)])));
        let ctx = run_context(config(&out), Arc::new(loader), None);
        let batch = Scheduler::from_context(ctx)
            .run(vec![AudioJob::new(&source)])
            .await;

        assert_eq!(batch.completed(), 1);
        assert_eq!(batch.jobs[0].speakers.len(), 1);
        assert!(out.join("call/speaker_0001").exists());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_failed_job_does_not_affect_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.wav");
        write_tone(&good, 5.0, 1000);

        let out = dir.path().join("out");
        let ctx = run_context(config(&out), Arc::new(CountingLoader::new()), None);
        let scheduler = Scheduler::from_context(ctx);
        let batch = scheduler
            .run(vec![
                AudioJob::new(dir.path().join("missing.wav")),
                AudioJob::new(&good),
            ])
            .await;

        assert_eq!(batch.jobs[0].status, JobStatus::Failed);
        assert_eq!(
            batch.jobs[0].error.as_ref().unwrap().kind,
            crate::error::ErrorKind::CatastrophicJob
        );
        assert_eq!(batch.jobs[1].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_zero_duration_job_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = run_context(config(dir.path()), Arc::new(CountingLoader::new()), None);
        let batch = Scheduler::from_context(ctx)
            .run(vec![AudioJob::new("silence.wav").with_duration(0.0)])
            .await;
        assert_eq!(batch.failed(), 1);
    }

    #[tokio::test]
    async fn test_without_speakers_chunks_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("memo.wav");
        write_tone(&source, 15.0, 1000);

        let out = dir.path().join("out");
        let config = PipelineConfig {
            stages: StageSet::all().with(StageKind::Diarize, false),
            ..config(&out)
        };
        let job = AudioJob::new(&source).with_settings(JobSettings::from_config(&config));
        let ctx = run_context(config, Arc::new(CountingLoader::new()), None);
        let batch = Scheduler::from_context(ctx).run(vec![job]).await;

        assert_eq!(batch.completed(), 1);
        assert!(out.join("memo/chunks/memo_chunk_0001.wav").exists());
        assert!(out.join("memo/chunks/memo_chunk_0002.wav").exists());
    }

    #[tokio::test]
    async fn test_plan_reports_chunks_without_running_stages() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("talk.wav");
        write_tone(&source, 25.0, 1000);

        let loader = Arc::new(CountingLoader::new());
        let ctx = Arc::new(RunContext::new(
            config(dir.path()),
            loader.clone(),
            Arc::new(WavMediaTool),
            None,
            1,
        ));
        let plan = Scheduler::from_context(ctx)
            .plan(&AudioJob::new(&source))
            .await
            .unwrap();
        assert_eq!(plan.chunks.len(), 3);
        assert_eq!(loader.loads(), 0);
    }
}
