//! Collaborators backed by external programs.
//!
//! Each model kind maps to a configured command. Audio is exchanged as WAV
//! files, results as JSON on stdout:
//!
//! - separation: `<program> <args> <input.wav> <output.wav>`, output is the vocals source
//! - voice activity: `<program> <args> <input.wav>` → `[{"start": s, "end": s}]`
//! - transcription: `<program> <args> <window.wav>` → `[{"start", "end", "text"}]`
//! - diarization: `<program> <args> <audio.wav>` → `[{"start", "end", "speaker"}]`,
//!   stderr lines are forwarded as progress
//!
//! The requested device is exposed to the child as `VOXSPLIT_DEVICE`, the
//! diarization credential as `VOXSPLIT_DIARIZATION_TOKEN`.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use super::{
    DiarizationProgress, Diarizer, Device, ModelHandle, ModelKind, ModelLoader, ModelRequest,
    SourceSeparator, SpeakerTurn, SpeechInterval, Transcriber, TranscriptSegment,
    VoiceActivityDetector,
};
use crate::config::{BackendCommands, CommandSpec};
use crate::io::wav::Waveform;

pub const DEVICE_ENV: &str = "VOXSPLIT_DEVICE";
pub const CREDENTIAL_ENV: &str = "VOXSPLIT_DIARIZATION_TOKEN";

/// Loader that wraps configured external commands
#[derive(Debug, Clone, Default)]
pub struct CommandModels {
    commands: BackendCommands,
}

impl CommandModels {
    pub fn new(commands: BackendCommands) -> Self {
        Self { commands }
    }

    fn spec(&self, kind: ModelKind) -> Option<&CommandSpec> {
        match kind {
            ModelKind::Separation => self.commands.separation.as_ref(),
            ModelKind::Transcription => self.commands.transcription.as_ref(),
            ModelKind::VoiceActivity => self.commands.voice_activity.as_ref(),
            ModelKind::Diarization => self.commands.diarization.as_ref(),
        }
    }
}

impl ModelLoader for CommandModels {
    fn load(&self, request: &ModelRequest) -> Result<ModelHandle> {
        let spec = self
            .spec(request.kind)
            .with_context(|| format!("no command configured for {} models", request.kind))?;

        let backend = CommandBackend {
            spec: spec.clone(),
            variant: request.variant.clone(),
            credential: request.credential.clone(),
        };

        Ok(match request.kind {
            ModelKind::Separation => ModelHandle::Separator(Arc::new(backend)),
            ModelKind::Transcription => ModelHandle::Transcriber(Arc::new(backend)),
            ModelKind::VoiceActivity => ModelHandle::VoiceActivity(Arc::new(backend)),
            ModelKind::Diarization => ModelHandle::Diarizer(Arc::new(backend)),
        })
    }
}

#[derive(Debug, Clone)]
struct CommandBackend {
    spec: CommandSpec,
    variant: String,
    credential: Option<String>,
}

impl CommandBackend {
    fn command(&self, device: Device, inputs: &[&Path]) -> Command {
        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .args(inputs)
            .env("VOXSPLIT_MODEL_VARIANT", &self.variant)
            .env(
                DEVICE_ENV,
                match device {
                    Device::Accelerator => "accelerator",
                    Device::Host => "host",
                },
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(token) = &self.credential {
            command.env(CREDENTIAL_ENV, token);
        }
        command
    }

    fn run_json<T: DeserializeOwned>(&self, device: Device, inputs: &[&Path]) -> Result<T> {
        let output = self
            .command(device, inputs)
            .output()
            .with_context(|| format!("failed to start {}", self.spec.program))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.spec.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("{} produced invalid JSON", self.spec.program))
    }
}

impl SourceSeparator for CommandBackend {
    fn separate(&self, audio: &Waveform, device: Device) -> Result<Vec<Waveform>> {
        let scratch = tempfile::tempdir()?;
        let input = scratch.path().join("input.wav");
        let output = scratch.path().join("vocals.wav");
        audio.write(&input)?;

        let result = self
            .command(device, &[input.as_path(), output.as_path()])
            .output()
            .with_context(|| format!("failed to start {}", self.spec.program))?;
        if !result.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.spec.program,
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }

        Ok(vec![Waveform::read(&output)?])
    }
}

impl VoiceActivityDetector for CommandBackend {
    fn detect(&self, audio: &Waveform, device: Device) -> Result<Vec<SpeechInterval>> {
        let scratch = tempfile::tempdir()?;
        let input = scratch.path().join("input.wav");
        audio.write(&input)?;
        self.run_json(device, &[input.as_path()])
    }
}

impl Transcriber for CommandBackend {
    fn transcribe(&self, window: &Path) -> Result<Vec<TranscriptSegment>> {
        self.run_json(Device::Host, &[window])
    }
}

impl Diarizer for CommandBackend {
    fn diarize(
        &self,
        audio: &Path,
        device: Device,
        progress: &dyn DiarizationProgress,
    ) -> Result<Vec<SpeakerTurn>> {
        let mut child = self
            .command(device, &[audio])
            .spawn()
            .with_context(|| format!("failed to start {}", self.spec.program))?;

        let mut stdout = child.stdout.take().context("diarizer stdout unavailable")?;
        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf);
            buf
        });

        let mut stderr_lines = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            for (step, line) in BufReader::new(stderr).lines().map_while(|l| l.ok()).enumerate() {
                progress.report(&line, step as u64 + 1, None);
                stderr_lines.push(line);
            }
        }

        let status = child.wait()?;
        let stdout = reader
            .join()
            .map_err(|_| anyhow::anyhow!("diarizer stdout reader panicked"))?;

        if !status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.spec.program,
                status,
                stderr_lines.join(" | ")
            );
        }
        serde_json::from_slice(&stdout)
            .with_context(|| format!("{} produced invalid JSON", self.spec.program))
    }
}
