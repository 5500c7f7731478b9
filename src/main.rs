use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use voxsplit::{
    run_worker, AudioJob, CommandModels, ConcurrencyStrategy, Ffmpeg, JobStatus, MediaTool,
    PipelineConfig, Scheduler, SplitMethod, StageSet, WavMediaTool, WorkerCommand, WorkerRequest,
};

#[derive(Parser)]
#[command(name = "voxsplit")]
#[command(author, version, about = "Split, clean and diarize long-form audio recordings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split recordings into chunks, run the requested stages and organize speakers
    Process {
        /// Input audio files
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,

        /// Output directory (one subdirectory per job)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Show how a recording would be split without running any stage
    Plan {
        /// Input audio file
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Run one job read from stdin and print its report as JSON
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        wav_only: bool,

        #[arg(short, long)]
        verbose: bool,

        #[arg(long, env = "VOXSPLIT_DIARIZATION_TOKEN", hide_env_values = true)]
        diarization_token: Option<String>,
    },
}

#[derive(Args)]
struct RunOptions {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target chunk length in seconds
    #[arg(long)]
    chunk_secs: Option<f64>,

    /// Comma-separated stages: denoise, silence, diarize (or "all", "none")
    #[arg(long)]
    stages: Option<String>,

    /// Split method: speech-boundary, fixed or whole
    #[arg(long)]
    split: Option<String>,

    /// Drop speaker segments shorter than this (0 keeps all)
    #[arg(long)]
    min_segment_secs: Option<f64>,

    /// Concurrency strategy: sequential, thread or process
    #[arg(long)]
    strategy: Option<String>,

    /// Maximum workers per pool
    #[arg(long)]
    workers: Option<usize>,

    /// Accelerator memory in GB; omit to run every stage on the host
    #[arg(long)]
    accelerator_gb: Option<f64>,

    /// Fraction of accelerator memory the run may use
    #[arg(long)]
    budget_fraction: Option<f64>,

    /// Credential for the diarization backend
    #[arg(long, env = "VOXSPLIT_DIARIZATION_TOKEN", hide_env_values = true)]
    diarization_token: Option<String>,

    /// Read WAV inputs in-process instead of calling ffmpeg
    #[arg(long)]
    wav_only: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl RunOptions {
    fn build_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)
                .with_context(|| format!("Failed to load config {:?}", path))?,
            None => PipelineConfig::default(),
        };

        if let Some(secs) = self.chunk_secs {
            config.target_chunk_secs = secs;
        }
        if let Some(stages) = &self.stages {
            config.stages = stages.parse::<StageSet>()?;
        }
        if let Some(split) = &self.split {
            config.split = split.parse::<SplitMethod>()?;
        }
        if let Some(secs) = self.min_segment_secs {
            config.min_speaker_segment_secs = secs;
        }
        let workers = self
            .workers
            .unwrap_or_else(|| config.concurrency.configured_workers());
        config.concurrency = match &self.strategy {
            Some(name) => ConcurrencyStrategy::parse(name, workers)?,
            None => match config.concurrency {
                ConcurrencyStrategy::Sequential => ConcurrencyStrategy::Sequential,
                ConcurrencyStrategy::BoundedThread { .. } => {
                    ConcurrencyStrategy::BoundedThread { max_workers: workers }
                }
                ConcurrencyStrategy::BoundedProcess { .. } => {
                    ConcurrencyStrategy::BoundedProcess { max_workers: workers }
                }
            },
        };
        if let Some(gb) = self.accelerator_gb {
            config.accelerator_memory_gb = Some(gb);
        }
        if let Some(fraction) = self.budget_fraction {
            config.accelerator_budget_fraction = fraction;
        }
        if self.diarization_token.is_some() {
            config.diarization_credential = self.diarization_token.clone();
        }

        config.validate()?;
        Ok(config)
    }

    fn scheduler(&self, config: PipelineConfig) -> Result<Scheduler> {
        let isolated = matches!(config.concurrency, ConcurrencyStrategy::BoundedProcess { .. });
        let loader = Arc::new(CommandModels::new(config.backends.clone()));
        let scheduler = Scheduler::new(config, loader, media_tool(self.wav_only))?;
        if !isolated {
            return Ok(scheduler);
        }

        let mut worker = WorkerCommand::current_exe()?;
        if self.wav_only {
            worker = worker.arg("--wav-only");
        }
        if self.verbose {
            worker = worker.arg("--verbose");
        }
        Ok(scheduler.with_worker(worker))
    }
}

fn media_tool(wav_only: bool) -> Arc<dyn MediaTool> {
    if wav_only {
        Arc::new(WavMediaTool)
    } else {
        Arc::new(Ffmpeg::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Process {
            input,
            output,
            options,
        } => {
            setup_logging(options.verbose);
            process(input, output, options).await
        }
        Commands::Plan { input, options } => {
            setup_logging(options.verbose);
            plan(input, options).await
        }
        Commands::Worker {
            wav_only,
            verbose,
            diarization_token,
        } => {
            // stdout carries the report
            let level = if verbose { "debug" } else { "info" };
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber).ok();
            worker(wav_only, diarization_token).await
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

async fn worker(wav_only: bool, credential: Option<String>) -> Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read worker request")?;
    let request: WorkerRequest =
        serde_json::from_str(&input).context("Invalid worker request")?;

    let loader = Arc::new(CommandModels::new(request.config.backends.clone()));
    let report = run_worker(request, credential, loader, media_tool(wav_only)).await;
    serde_json::to_writer(std::io::stdout().lock(), &report)
        .context("Failed to write worker report")?;
    Ok(())
}

async fn process(input: Vec<PathBuf>, output: Option<PathBuf>, options: RunOptions) -> Result<()> {
    let mut config = options.build_config()?;
    if let Some(dir) = output {
        config.output_dir = dir;
    }
    info!("Writing results to {:?}", config.output_dir);

    let scheduler = options.scheduler(config)?;
    let jobs: Vec<AudioJob> = input.into_iter().map(AudioJob::new).collect();
    let batch = scheduler.run(jobs).await;

    println!("Batch Summary");
    println!("=============");
    println!("Workers: {}", batch.pool_size);
    for job in &batch.jobs {
        match job.status {
            JobStatus::Completed => println!(
                "{}: {} chunks, {} speakers -> {}",
                job.job_name,
                job.chunks.len(),
                job.speakers.len(),
                job.output_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ),
            JobStatus::Failed => println!(
                "{}: FAILED ({})",
                job.job_name,
                job.error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default()
            ),
        }
    }
    println!(
        "Completed: {}, failed: {}",
        batch.completed(),
        batch.failed()
    );

    if !batch.jobs.is_empty() && batch.completed() == 0 {
        anyhow::bail!("every job failed");
    }
    Ok(())
}

async fn plan(input: PathBuf, options: RunOptions) -> Result<()> {
    let config = options.build_config()?;
    let scheduler = options.scheduler(config)?;
    let job = AudioJob::new(&input);
    let plan = scheduler
        .plan(&job)
        .await
        .with_context(|| format!("Failed to plan {:?}", input))?;

    println!("Chunk Plan: {}", job.name);
    println!("===========");
    println!("Boundary mode: {:?}", plan.mode);
    println!("Boundary candidates: {}", plan.candidates);
    println!();
    for chunk in &plan.chunks {
        println!(
            "{}  {:>10.3}s - {:>10.3}s  ({:.1}s)",
            chunk.label(),
            chunk.start,
            chunk.end,
            chunk.duration()
        );
    }
    Ok(())
}
