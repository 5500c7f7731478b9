use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{PipelineConfig, SplitMethod, StageSet};

/// Per-job processing settings, defaulting to the run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    pub stages: StageSet,
    pub split: SplitMethod,
    pub target_chunk_secs: f64,
    pub min_speaker_segment_secs: f64,
}

impl JobSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            stages: config.stages,
            split: config.split,
            target_chunk_secs: config.target_chunk_secs,
            min_speaker_segment_secs: config.min_speaker_segment_secs,
        }
    }
}

/// One source recording submitted for processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioJob {
    /// Unique identifier for this job
    pub id: String,
    /// Human-readable name, used for output directory names
    pub name: String,
    pub source: PathBuf,
    /// Total duration in seconds; probed from the source when absent
    pub duration: Option<f64>,
    /// Overrides for the run configuration
    pub settings: Option<JobSettings>,
}

impl AudioJob {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: job_name(&source),
            source,
            duration: None,
            settings: None,
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Effective settings for this job
    pub fn settings_or(&self, config: &PipelineConfig) -> JobSettings {
        self.settings
            .clone()
            .unwrap_or_else(|| JobSettings::from_config(config))
    }
}

/// File stem with characters unsafe for directory names replaced
fn job_name(source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "audio".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_name_from_source() {
        let job = AudioJob::new("/data/Episode 01 (final).mp3");
        assert_eq!(job.name, "Episode_01__final_");
        assert!(job.duration.is_none());
        assert_eq!(AudioJob::new("/").name, "audio");
    }

    #[test]
    fn test_jobs_get_distinct_ids() {
        let a = AudioJob::new("a.wav");
        let b = AudioJob::new("a.wav");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_settings_default_to_config() {
        let config = PipelineConfig {
            target_chunk_secs: 120.0,
            ..Default::default()
        };
        let job = AudioJob::new("a.wav");
        assert_eq!(job.settings_or(&config).target_chunk_secs, 120.0);

        let custom = JobSettings {
            target_chunk_secs: 30.0,
            ..JobSettings::from_config(&config)
        };
        let job = job.with_settings(custom.clone());
        assert_eq!(job.settings_or(&config), custom);
    }
}
