//! Contracts for the external inference collaborators.
//!
//! Model internals live outside this crate. The pipeline only needs the
//! shapes below; loaders hand back [`ModelHandle`]s that the model cache
//! shares across workers.

pub mod command;

pub use command::*;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::StageKind;
use crate::io::wav::Waveform;

/// Where a collaborator should run an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Accelerator,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Separation,
    Transcription,
    VoiceActivity,
    Diarization,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Separation => "separation",
            ModelKind::Transcription => "transcription",
            ModelKind::VoiceActivity => "voice_activity",
            ModelKind::Diarization => "diarization",
        }
    }

    /// Model kind a stage depends on
    pub fn for_stage(stage: StageKind) -> Self {
        match stage {
            StageKind::Denoise => ModelKind::Separation,
            StageKind::SilenceRemoval => ModelKind::VoiceActivity,
            StageKind::Diarize => ModelKind::Diarization,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recognized span of speech within an analysis window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start in seconds, relative to the window
    pub start: f64,
    /// End in seconds, relative to the window
    pub end: f64,
    #[serde(default)]
    pub text: String,
}

/// A detected speech interval, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeechInterval {
    pub start: f64,
    pub end: f64,
}

/// One raw diarizer output interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerTurn {
    pub start: f64,
    pub end: f64,
    #[serde(alias = "speaker")]
    pub label: String,
}

impl SpeakerTurn {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Source separation: returns the separated sources, vocals first
pub trait SourceSeparator: Send + Sync {
    fn separate(&self, audio: &Waveform, device: Device) -> Result<Vec<Waveform>>;
}

/// Segmentation/transcription of a short audio window
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, window: &Path) -> Result<Vec<TranscriptSegment>>;
}

pub trait VoiceActivityDetector: Send + Sync {
    fn detect(&self, audio: &Waveform, device: Device) -> Result<Vec<SpeechInterval>>;
}

/// Progress side channel of the diarizer
pub trait DiarizationProgress: Send + Sync {
    fn report(&self, step: &str, completed: u64, total: Option<u64>);
}

/// Speaker diarization of a whole audio file.
///
/// Implementations are not assumed to be safe to call concurrently; the
/// pipeline serializes calls through the diarization coordinator.
pub trait Diarizer: Send + Sync {
    fn diarize(
        &self,
        audio: &Path,
        device: Device,
        progress: &dyn DiarizationProgress,
    ) -> Result<Vec<SpeakerTurn>>;
}

/// Cached, shareable reference to one loaded collaborator
#[derive(Clone)]
pub enum ModelHandle {
    Separator(Arc<dyn SourceSeparator>),
    Transcriber(Arc<dyn Transcriber>),
    VoiceActivity(Arc<dyn VoiceActivityDetector>),
    Diarizer(Arc<dyn Diarizer>),
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelHandle({})", self.kind())
    }
}

impl ModelHandle {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelHandle::Separator(_) => ModelKind::Separation,
            ModelHandle::Transcriber(_) => ModelKind::Transcription,
            ModelHandle::VoiceActivity(_) => ModelKind::VoiceActivity,
            ModelHandle::Diarizer(_) => ModelKind::Diarization,
        }
    }

    pub fn separator(&self) -> Result<Arc<dyn SourceSeparator>> {
        match self {
            ModelHandle::Separator(model) => Ok(model.clone()),
            other => anyhow::bail!("expected a separation model, got {}", other.kind()),
        }
    }

    pub fn transcriber(&self) -> Result<Arc<dyn Transcriber>> {
        match self {
            ModelHandle::Transcriber(model) => Ok(model.clone()),
            other => anyhow::bail!("expected a transcription model, got {}", other.kind()),
        }
    }

    pub fn voice_activity(&self) -> Result<Arc<dyn VoiceActivityDetector>> {
        match self {
            ModelHandle::VoiceActivity(model) => Ok(model.clone()),
            other => anyhow::bail!("expected a voice activity model, got {}", other.kind()),
        }
    }

    pub fn diarizer(&self) -> Result<Arc<dyn Diarizer>> {
        match self {
            ModelHandle::Diarizer(model) => Ok(model.clone()),
            other => anyhow::bail!("expected a diarization model, got {}", other.kind()),
        }
    }
}

/// What the model cache asks a loader for
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub kind: ModelKind,
    pub variant: String,
    pub device: Device,
    pub credential: Option<String>,
}

/// Instantiates collaborators on demand
pub trait ModelLoader: Send + Sync {
    fn load(&self, request: &ModelRequest) -> Result<ModelHandle>;

    /// Release whatever `load` acquired for this handle
    fn unload(&self, _handle: &ModelHandle) {}
}
