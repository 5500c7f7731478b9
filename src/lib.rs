pub mod config;
pub mod error;
pub mod inference;
pub mod io;
pub mod models;
pub mod resources;
pub mod scheduler;
pub mod stages;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{
    ConcurrencyStrategy, PipelineConfig, SilenceConfig, SplitMethod, StageBudget, StageKind,
    StageSet,
};
pub use error::{ErrorKind, PipelineError, Result, StageError};
pub use inference::{CommandModels, Device, ModelKind, ModelLoader};
pub use io::{Ffmpeg, MediaTool, OutputOrganizer, WavMediaTool};
pub use models::{AudioJob, Chunk, JobSettings, SpeakerGroup, SpeakerSegment, StageStatus};
pub use resources::{Accelerator, ModelCache, ResourceManager, StaticAccelerator};
pub use scheduler::{BatchReport, HostCapacity, JobReport, JobStatus, RunContext, Scheduler};
pub use stages::{BoundaryCoordinator, BoundaryMode, BoundaryPlan, DiarizationCoordinator, StagePipeline};
pub use worker::{run_worker, WorkerCommand, WorkerRequest};
