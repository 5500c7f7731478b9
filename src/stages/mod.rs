pub mod pipeline;
pub mod stage0_boundaries;
pub mod stage1_denoise;
pub mod stage2_silence;
pub mod stage3_diarize;
pub mod stage4_aggregate;

pub use pipeline::*;
pub use stage0_boundaries::*;
pub use stage1_denoise::*;
pub use stage2_silence::*;
pub use stage3_diarize::*;
pub use stage4_aggregate::*;

use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Run blocking work on the blocking pool with a wall-clock limit.
///
/// On timeout only the wait is abandoned; the closure keeps running until it
/// returns on its own.
pub(crate) async fn run_blocking<T, F>(stage: &str, limit: Duration, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(PipelineError::inference(stage, join)),
        Err(_) => Err(PipelineError::Timeout {
            stage: stage.to_string(),
            seconds: limit.as_secs_f64(),
        }),
    }
}
