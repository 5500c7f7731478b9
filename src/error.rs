//! Error taxonomy for the processing pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Admission denied by the accelerator budget even after a forced cleanup
    #[error("accelerator budget exhausted for {stage}: {required_gb:.2}GB required, {available_gb:.2}GB available")]
    TransientResource {
        stage: String,
        required_gb: f64,
        available_gb: f64,
    },

    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    #[error("{stage} inference failed: {message}")]
    Inference { stage: String, message: String },

    #[error("{stage} timed out after {seconds:.1}s")]
    Timeout { stage: String, seconds: f64 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("boundary resolution unavailable: {0}")]
    BoundaryResolution(String),

    #[error("job {job} failed: {reason}")]
    CatastrophicJob { job: String, reason: String },

    #[error("audio format error: {0}")]
    Audio(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Coarse category of a [`PipelineError`], used in reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientResource,
    ExternalTool,
    Inference,
    Timeout,
    Configuration,
    BoundaryResolution,
    CatastrophicJob,
    Audio,
    Io,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::TransientResource { .. } => ErrorKind::TransientResource,
            PipelineError::ExternalTool { .. } => ErrorKind::ExternalTool,
            PipelineError::Inference { .. } => ErrorKind::Inference,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::Configuration(_) => ErrorKind::Configuration,
            PipelineError::BoundaryResolution(_) => ErrorKind::BoundaryResolution,
            PipelineError::CatastrophicJob { .. } => ErrorKind::CatastrophicJob,
            PipelineError::Audio(_) => ErrorKind::Audio,
            PipelineError::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn inference(stage: impl Into<String>, error: impl std::fmt::Display) -> Self {
        PipelineError::Inference {
            stage: stage.into(),
            message: format!("{:#}", error),
        }
    }

    pub(crate) fn external_tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::ExternalTool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Serializable record of a failure attached to a stage result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for StageError {
    fn from(error: &PipelineError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_resource_display() {
        let error = PipelineError::TransientResource {
            stage: "denoise".to_string(),
            required_gb: 2.0,
            available_gb: 0.5,
        };
        assert_eq!(
            error.to_string(),
            "accelerator budget exhausted for denoise: 2.00GB required, 0.50GB available"
        );
        assert_eq!(error.kind(), ErrorKind::TransientResource);
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let error: PipelineError = io.into();
        assert_eq!(error.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_stage_error_from_pipeline_error() {
        let error = PipelineError::inference("diarize", anyhow::anyhow!("model crashed"));
        let record = StageError::from(&error);
        assert_eq!(record.kind, ErrorKind::Inference);
        assert_eq!(record.message, "diarize inference failed: model crashed");
    }
}
