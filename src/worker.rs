//! Job-level process isolation for the bounded-process strategy.
//!
//! The parent re-invokes an executable (normally this binary's hidden
//! `worker` subcommand) once per job. The job goes in as JSON on stdin and
//! the [`JobReport`] comes back as JSON on stdout; logs stay on stderr.
//! Workers of one run share a diarization lock file and split the
//! accelerator budget evenly between them.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::inference::{ModelLoader, CREDENTIAL_ENV};
use crate::io::media::MediaTool;
use crate::io::output::OutputOrganizer;
use crate::models::AudioJob;
use crate::resources::{Accelerator, StaticAccelerator};
use crate::scheduler::{run_job, workspace, JobReport, RunContext};
use crate::stages::DiarizationCoordinator;

/// Everything a worker process needs to run one job.
///
/// The diarization credential is not part of the request; it travels in the
/// worker's environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub config: PipelineConfig,
    pub job: AudioJob,
    /// Output directory reserved for the job by the parent
    pub job_dir: PathBuf,
    /// Chunk pool size inside the worker
    pub pool_size: usize,
    pub diarization_lock: PathBuf,
}

/// Program and arguments that start a worker process
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The running executable's `worker` subcommand
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }
}

/// Parent side: starts one worker per job
pub(crate) struct ProcessPool {
    command: WorkerCommand,
    config: PipelineConfig,
    pool_size: usize,
    run_dir: tempfile::TempDir,
}

impl ProcessPool {
    pub(crate) fn new(command: WorkerCommand, ctx: &RunContext) -> Result<Self> {
        let run_dir = workspace(&ctx.config)?;
        let mut config = ctx.config.clone();
        config.accelerator_memory_gb = config
            .accelerator_memory_gb
            .map(|gb| gb / ctx.pool_size as f64);
        Ok(Self {
            command,
            config,
            pool_size: ctx.pool_size,
            run_dir,
        })
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.run_dir.path().join("diarization.lock")
    }

    /// Run `job` in its own process. Any worker failure becomes a failed
    /// report for this job only.
    pub(crate) async fn run(&self, job: AudioJob, job_dir: PathBuf) -> JobReport {
        match self.spawn(&job, job_dir).await {
            Ok(report) => report,
            Err(e) => {
                error!("{}: worker failed: {}", job.name, e);
                JobReport::failed(&job, &e)
            }
        }
    }

    async fn spawn(&self, job: &AudioJob, job_dir: PathBuf) -> Result<JobReport> {
        let request = WorkerRequest {
            config: self.config.clone(),
            job: job.clone(),
            job_dir,
            pool_size: self.pool_size,
            diarization_lock: self.lock_path(),
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| catastrophic(job, format!("cannot encode worker request: {}", e)))?;

        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(token) = &self.config.diarization_credential {
            command.env(CREDENTIAL_ENV, token);
        }

        let mut child = command.spawn().map_err(|e| {
            PipelineError::external_tool(
                "worker",
                format!("failed to start {:?}: {}", self.command.program, e),
            )
        })?;
        debug!("{}: worker process {:?} started", job.name, child.id());

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(catastrophic(
                job,
                format!("worker exited with {}", output.status),
            ));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| catastrophic(job, format!("worker returned an invalid report: {}", e)))
    }
}

fn catastrophic(job: &AudioJob, reason: String) -> PipelineError {
    PipelineError::CatastrophicJob {
        job: job.name.clone(),
        reason,
    }
}

/// Worker side: run one job to completion and return its report
pub async fn run_worker(
    request: WorkerRequest,
    credential: Option<String>,
    loader: Arc<dyn ModelLoader>,
    media: Arc<dyn MediaTool>,
) -> JobReport {
    let WorkerRequest {
        mut config,
        job,
        job_dir,
        pool_size,
        diarization_lock,
    } = request;
    config.diarization_credential = credential;
    if let Err(e) = config.validate() {
        error!("{}: {}", job.name, e);
        return JobReport::failed(&job, &e);
    }

    let accelerator = config
        .accelerator_memory_gb
        .map(|gb| Arc::new(StaticAccelerator::new("accelerator", gb)) as Arc<dyn Accelerator>);
    let mut ctx = RunContext::new(config, loader, media, accelerator, pool_size);
    ctx.diarization = Arc::new(DiarizationCoordinator::with_lock_file(diarization_lock));
    let ctx = Arc::new(ctx);
    let organizer = Arc::new(OutputOrganizer::new(ctx.config.output_dir.clone()));

    info!("{}: running in worker process {}", job.name, std::process::id());
    let report = run_job(&ctx, &organizer, job, job_dir).await;
    ctx.models.teardown().await;
    report
}
