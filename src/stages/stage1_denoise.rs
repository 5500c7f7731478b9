use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::inference::{Device, SourceSeparator};
use crate::io::wav::Waveform;

/// Where the vocals source of `input` is written
pub fn vocals_path(input: &Path, output_dir: &Path) -> PathBuf {
    output_dir.join(format!("{}_vocals.wav", file_stem(input)))
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".to_string())
}

/// Execute the denoise stage: keep only the vocals source
///
/// An output left by an earlier run for the same input is reused.
pub fn denoise(
    separator: &dyn SourceSeparator,
    input: &Path,
    output_dir: &Path,
    device: Device,
) -> Result<PathBuf> {
    let output = vocals_path(input, output_dir);
    if output.exists() {
        info!("Denoise: reusing {:?}", output);
        return Ok(output);
    }

    let audio = Waveform::read(input)?;
    debug!(
        "Denoise: separating {:.1}s from {:?} on {:?}",
        audio.duration_secs(),
        input,
        device
    );

    let sources = separator
        .separate(&audio, device)
        .map_err(|e| PipelineError::inference("denoise", e))?;
    let vocals = sources
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::inference("denoise", "separator returned no sources"))?;

    vocals.write(&output)?;
    Ok(output)
}
