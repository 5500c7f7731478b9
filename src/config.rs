use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// One optional transformation applied to a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Denoise,
    SilenceRemoval,
    Diarize,
}

impl StageKind {
    /// Fixed execution order
    pub const ORDER: [StageKind; 3] = [
        StageKind::Denoise,
        StageKind::SilenceRemoval,
        StageKind::Diarize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Denoise => "denoise",
            StageKind::SilenceRemoval => "silence_removal",
            StageKind::Diarize => "diarize",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested subset of stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSet {
    pub denoise: bool,
    pub silence_removal: bool,
    pub diarize: bool,
}

impl Default for StageSet {
    fn default() -> Self {
        Self::all()
    }
}

impl StageSet {
    pub fn all() -> Self {
        Self {
            denoise: true,
            silence_removal: true,
            diarize: true,
        }
    }

    pub fn none() -> Self {
        Self {
            denoise: false,
            silence_removal: false,
            diarize: false,
        }
    }

    pub fn contains(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::Denoise => self.denoise,
            StageKind::SilenceRemoval => self.silence_removal,
            StageKind::Diarize => self.diarize,
        }
    }

    pub fn with(mut self, stage: StageKind, enabled: bool) -> Self {
        match stage {
            StageKind::Denoise => self.denoise = enabled,
            StageKind::SilenceRemoval => self.silence_removal = enabled,
            StageKind::Diarize => self.diarize = enabled,
        }
        self
    }

    /// Intersection with another set
    pub fn intersect(&self, other: &StageSet) -> StageSet {
        StageSet {
            denoise: self.denoise && other.denoise,
            silence_removal: self.silence_removal && other.silence_removal,
            diarize: self.diarize && other.diarize,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = StageKind> + '_ {
        StageKind::ORDER.into_iter().filter(|s| self.contains(*s))
    }
}

impl FromStr for StageSet {
    type Err = PipelineError;

    /// Parse a comma-separated list such as `denoise,vad,diar`
    fn from_str(input: &str) -> Result<Self> {
        let mut set = StageSet::none();
        for name in input.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let stage = match name.to_ascii_lowercase().as_str() {
                "denoise" | "clean" => StageKind::Denoise,
                "silence" | "silence_removal" | "silence-removal" | "vad" => {
                    StageKind::SilenceRemoval
                }
                "diarize" | "diar" | "diarization" => StageKind::Diarize,
                "all" => return Ok(StageSet::all()),
                "none" => return Ok(StageSet::none()),
                other => {
                    return Err(PipelineError::Configuration(format!(
                        "unknown stage '{}'",
                        other
                    )));
                }
            };
            set = set.with(stage, true);
        }
        Ok(set)
    }
}

/// How a job's audio is cut into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMethod {
    /// One chunk covering the whole recording
    Whole,
    /// Provisional targets are used directly as cut points
    FixedDuration,
    /// Cut points move to the nearest detected speech boundary
    #[default]
    SpeechBoundary,
}

impl FromStr for SplitMethod {
    type Err = PipelineError;

    fn from_str(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "whole" | "none" => Ok(SplitMethod::Whole),
            "fixed" | "fixed_duration" | "fixed-duration" | "duration" => {
                Ok(SplitMethod::FixedDuration)
            }
            "speech" | "speech_boundary" | "speech-boundary" | "word_boundary" => {
                Ok(SplitMethod::SpeechBoundary)
            }
            other => Err(PipelineError::Configuration(format!(
                "unknown split method '{}'",
                other
            ))),
        }
    }
}

/// Worker pool strategy applied across jobs and across chunks of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConcurrencyStrategy {
    Sequential,
    BoundedThread { max_workers: usize },
    BoundedProcess { max_workers: usize },
}

impl Default for ConcurrencyStrategy {
    fn default() -> Self {
        ConcurrencyStrategy::BoundedThread { max_workers: 4 }
    }
}

impl ConcurrencyStrategy {
    pub fn parse(name: &str, max_workers: usize) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sequential" | "seq" => Ok(ConcurrencyStrategy::Sequential),
            "thread" | "threads" | "bounded-thread" | "bounded_thread" => {
                Ok(ConcurrencyStrategy::BoundedThread { max_workers })
            }
            "process" | "processes" | "bounded-process" | "bounded_process" => {
                Ok(ConcurrencyStrategy::BoundedProcess { max_workers })
            }
            other => Err(PipelineError::Configuration(format!(
                "unknown concurrency strategy '{}'",
                other
            ))),
        }
    }

    pub fn configured_workers(&self) -> usize {
        match self {
            ConcurrencyStrategy::Sequential => 1,
            ConcurrencyStrategy::BoundedThread { max_workers }
            | ConcurrencyStrategy::BoundedProcess { max_workers } => *max_workers,
        }
    }
}

/// Accelerator requirements and limits for a single stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageBudget {
    /// Accelerator memory the stage needs, in GB
    pub required_gb: f64,
    /// Whether the stage can run on the host when admission is denied
    pub host_fallback: bool,
    /// Wall-clock limit for one invocation, in seconds
    pub timeout_secs: f64,
}

impl StageBudget {
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_secs).unwrap_or(Duration::MAX)
    }
}

/// Positive, finite seconds that fit a `Duration`
fn seconds(value: f64) -> Option<Duration> {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).ok()
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageBudgets {
    pub denoise: StageBudget,
    pub silence_removal: StageBudget,
    pub diarize: StageBudget,
}

impl Default for StageBudgets {
    fn default() -> Self {
        Self {
            denoise: StageBudget {
                required_gb: 2.0,
                host_fallback: true,
                timeout_secs: 7200.0,
            },
            silence_removal: StageBudget {
                required_gb: 0.5,
                host_fallback: true,
                timeout_secs: 7200.0,
            },
            diarize: StageBudget {
                required_gb: 1.5,
                host_fallback: true,
                timeout_secs: 7200.0,
            },
        }
    }
}

impl StageBudgets {
    pub fn get(&self, stage: StageKind) -> &StageBudget {
        match stage {
            StageKind::Denoise => &self.denoise,
            StageKind::SilenceRemoval => &self.silence_removal,
            StageKind::Diarize => &self.diarize,
        }
    }
}

/// Boundary search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// Half-width of the analysis window around each provisional cut, in seconds
    pub search_window_secs: f64,
    /// Timeout for one media extraction or window transcription, in seconds
    pub analysis_timeout_secs: f64,
}

impl BoundaryConfig {
    pub fn analysis_timeout(&self) -> Duration {
        seconds(self.analysis_timeout_secs).unwrap_or(Duration::MAX)
    }
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            search_window_secs: 30.0,
            analysis_timeout_secs: 600.0,
        }
    }
}

/// Speech span cleanup applied to voice activity output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SilenceConfig {
    /// Speech spans shorter than this are discarded, in seconds
    pub min_speech_secs: f64,
    /// Silences shorter than this are kept and join their neighbours, in seconds
    pub min_silence_secs: f64,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            min_speech_secs: 0.25,
            min_silence_secs: 0.4,
        }
    }
}

/// Model variants requested from the model loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelVariants {
    pub separation: String,
    pub transcription: String,
    pub voice_activity: String,
    pub diarization: String,
}

impl Default for ModelVariants {
    fn default() -> Self {
        Self {
            separation: "htdemucs".to_string(),
            transcription: "base".to_string(),
            voice_activity: "silero_vad".to_string(),
            diarization: "speaker-diarization-3.1".to_string(),
        }
    }
}

/// External program backing one model kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendCommands {
    pub separation: Option<CommandSpec>,
    pub transcription: Option<CommandSpec>,
    pub voice_activity: Option<CommandSpec>,
    pub diarization: Option<CommandSpec>,
}

/// Run-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Target chunk length in seconds
    pub target_chunk_secs: f64,
    /// Speaker segments shorter than this are dropped; 0 disables filtering
    pub min_speaker_segment_secs: f64,
    pub stages: StageSet,
    pub split: SplitMethod,
    pub concurrency: ConcurrencyStrategy,
    /// Fraction of accelerator memory the run may use
    pub accelerator_budget_fraction: f64,
    /// Advisory accelerator memory size; `None` means host-only execution
    pub accelerator_memory_gb: Option<f64>,
    pub boundary: BoundaryConfig,
    pub silence: SilenceConfig,
    pub budgets: StageBudgets,
    pub models: ModelVariants,
    pub backends: BackendCommands,
    pub output_dir: PathBuf,
    /// Parent directory for per-job scratch workspaces (system temp if unset)
    pub temp_dir: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub diarization_credential: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_chunk_secs: 600.0,
            min_speaker_segment_secs: 1.5,
            stages: StageSet::all(),
            split: SplitMethod::default(),
            concurrency: ConcurrencyStrategy::default(),
            accelerator_budget_fraction: 0.95,
            accelerator_memory_gb: None,
            boundary: BoundaryConfig::default(),
            silence: SilenceConfig::default(),
            budgets: StageBudgets::default(),
            models: ModelVariants::default(),
            backends: BackendCommands::default(),
            output_dir: PathBuf::from("results"),
            temp_dir: None,
            diarization_credential: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Reject values no run can sensibly use
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(PipelineError::Configuration(message));

        if !(self.target_chunk_secs.is_finite() && self.target_chunk_secs > 0.0) {
            return invalid(format!(
                "target chunk length must be positive, got {}",
                self.target_chunk_secs
            ));
        }
        if !(self.min_speaker_segment_secs.is_finite() && self.min_speaker_segment_secs >= 0.0) {
            return invalid(format!(
                "minimum speaker segment duration must be >= 0, got {}",
                self.min_speaker_segment_secs
            ));
        }
        if !(self.accelerator_budget_fraction > 0.0 && self.accelerator_budget_fraction <= 1.0) {
            return invalid(format!(
                "accelerator budget fraction must be in (0, 1], got {}",
                self.accelerator_budget_fraction
            ));
        }
        if let Some(total) = self.accelerator_memory_gb {
            if !(total.is_finite() && total > 0.0) {
                return invalid(format!("accelerator memory must be positive, got {}", total));
            }
        }
        if self.concurrency.configured_workers() == 0 {
            return invalid("worker count must be at least 1".to_string());
        }
        if seconds(self.boundary.analysis_timeout_secs).is_none() {
            return invalid(format!(
                "boundary analysis timeout must be positive and finite, got {}",
                self.boundary.analysis_timeout_secs
            ));
        }
        if !(self.boundary.search_window_secs.is_finite() && self.boundary.search_window_secs > 0.0) {
            return invalid(format!(
                "boundary search window must be positive, got {}",
                self.boundary.search_window_secs
            ));
        }
        for stage in StageKind::ORDER {
            let budget = self.budgets.get(stage);
            if seconds(budget.timeout_secs).is_none() {
                return invalid(format!(
                    "{} timeout must be positive and finite, got {}",
                    stage, budget.timeout_secs
                ));
            }
            if !(budget.required_gb.is_finite() && budget.required_gb >= 0.0) {
                return invalid(format!("{} memory requirement must be >= 0", stage));
            }
        }
        for (name, value) in [
            ("minimum speech", self.silence.min_speech_secs),
            ("minimum silence", self.silence.min_silence_secs),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("{} duration must be >= 0, got {}", name, value));
            }
        }
        Ok(())
    }

    pub fn variant(&self, stage: StageKind) -> &str {
        match stage {
            StageKind::Denoise => &self.models.separation,
            StageKind::SilenceRemoval => &self.models.voice_activity,
            StageKind::Diarize => &self.models.diarization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.target_chunk_secs, 600.0);
        assert_eq!(config.min_speaker_segment_secs, 1.5);
        assert_eq!(config.split, SplitMethod::SpeechBoundary);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = PipelineConfig {
            target_chunk_secs: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration(_))
        ));

        let config = PipelineConfig {
            accelerator_budget_fraction: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            concurrency: ConcurrencyStrategy::BoundedThread { max_workers: 0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            min_speaker_segment_secs: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unbounded_durations() {
        let mut config = PipelineConfig::default();
        config.budgets.denoise.timeout_secs = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.budgets.diarize.timeout_secs = 1e300;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.boundary.analysis_timeout_secs = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.boundary.search_window_secs = f64::NAN;
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            accelerator_memory_gb: Some(f64::INFINITY),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.silence.min_silence_secs = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeouts_never_panic() {
        let budget = StageBudget {
            required_gb: 0.0,
            host_fallback: true,
            timeout_secs: f64::INFINITY,
        };
        assert_eq!(budget.timeout(), Duration::MAX);

        let budget = StageBudget {
            timeout_secs: 2.5,
            ..budget
        };
        assert_eq!(budget.timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_load_toml_rejects_infinite_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voxsplit.toml");
        fs::write(&path, "[budgets.denoise]\nrequired_gb = 2.0\nhost_fallback = true\ntimeout_secs = inf\n").unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert!(config.budgets.denoise.timeout_secs.is_infinite());
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_stage_set_parse() {
        let set: StageSet = "denoise, diar".parse().unwrap();
        assert!(set.denoise);
        assert!(!set.silence_removal);
        assert!(set.diarize);
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![StageKind::Denoise, StageKind::Diarize]
        );

        assert_eq!("all".parse::<StageSet>().unwrap(), StageSet::all());
        assert_eq!("none".parse::<StageSet>().unwrap(), StageSet::none());
        assert!("denoise,karaoke".parse::<StageSet>().is_err());
    }

    #[test]
    fn test_stage_set_order_is_fixed() {
        let set: StageSet = "diarize,vad,denoise".parse().unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), StageKind::ORDER.to_vec());
    }

    #[test]
    fn test_concurrency_strategy_parse() {
        assert_eq!(
            ConcurrencyStrategy::parse("sequential", 8).unwrap(),
            ConcurrencyStrategy::Sequential
        );
        assert_eq!(
            ConcurrencyStrategy::parse("bounded-process", 3).unwrap(),
            ConcurrencyStrategy::BoundedProcess { max_workers: 3 }
        );
        assert_eq!(ConcurrencyStrategy::Sequential.configured_workers(), 1);
        assert!(ConcurrencyStrategy::parse("fork-bomb", 1).is_err());
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voxsplit.toml");
        fs::write(
            &path,
            r#"
target_chunk_secs = 300.0
split = "fixed_duration"

[stages]
denoise = false

[concurrency]
kind = "bounded_thread"
max_workers = 2

[budgets.diarize]
required_gb = 3.0
host_fallback = false
timeout_secs = 60.0

[backends.diarization]
program = "diarize-cli"
args = ["--json"]
"#,
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.target_chunk_secs, 300.0);
        assert_eq!(config.split, SplitMethod::FixedDuration);
        assert!(!config.stages.denoise);
        assert!(config.stages.diarize);
        assert_eq!(
            config.concurrency,
            ConcurrencyStrategy::BoundedThread { max_workers: 2 }
        );
        assert!(!config.budgets.diarize.host_fallback);
        assert_eq!(config.budgets.denoise.required_gb, 2.0);
        assert_eq!(
            config.backends.diarization.as_ref().unwrap().program,
            "diarize-cli".to_string()
        );
        assert_eq!(config.silence, SilenceConfig::default());
        assert!(config.validate().is_ok());
    }
}
