use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::download::PollPolicy;
use crate::movie::Quality;
use crate::progress::TranscodeTrigger;
use crate::readiness::ReadinessPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config directory not found")]
    NoConfigDir,
    #[error("config file not found at {0}")]
    NotFound(PathBuf),
    #[error("failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub readiness: ReadinessPolicy,
    #[serde(default)]
    pub transcode: TranscodeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// librqbit HTTP API of an external daemon; unset starts an embedded one
    pub url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl DaemonConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Default, Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub download_dir: Option<PathBuf>,
    pub video_dir: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
}

impl StorageConfig {
    fn base_dir() -> PathBuf {
        ProjectDirs::from("", "", "hypertube")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join("hypertube"))
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| Self::base_dir().join("downloads"))
    }

    pub fn video_dir(&self) -> PathBuf {
        self.video_dir
            .clone()
            .unwrap_or_else(|| Self::base_dir().join("videos"))
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| Self::base_dir().join("movies.json"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Used when an acquisition request names no quality
    pub default_quality: Quality,
    pub transcode_trigger_percent: f64,
    pub transcode_trigger_bytes: Option<u64>,
    pub poll_interval_ms: u64,
    pub max_poll_failures: u32,
    pub backoff_max_ms: u64,
    pub stall_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_quality: Quality::P720,
            transcode_trigger_percent: 40.0,
            transcode_trigger_bytes: None,
            poll_interval_ms: 2000,
            max_poll_failures: 5,
            backoff_max_ms: 30_000,
            stall_timeout_secs: 600,
        }
    }
}

impl PipelineConfig {
    pub fn trigger(&self) -> TranscodeTrigger {
        TranscodeTrigger {
            percent: self.transcode_trigger_percent,
            leading_bytes: self.transcode_trigger_bytes,
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_failures: self.max_poll_failures,
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub ffmpeg: String,
    /// Lower qualities transcoded next to the selected one
    pub extra_qualities: Vec<Quality>,
    pub segment_secs: u32,
    pub preset: String,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            extra_qualities: vec![Quality::P480],
            segment_secs: 6,
            preset: "veryfast".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("", "", "hypertube")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if let Some(url) = &self.daemon.url {
            let parsed = url::Url::parse(url.trim_end_matches('/')).map_err(|e| {
                ConfigError::ValidationError(format!("daemon.url is not a valid URL: {}", e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return invalid("daemon.url must start with http:// or https://");
            }
        }

        if self.daemon.request_timeout_secs == 0 {
            return invalid("daemon.request_timeout_secs must be positive");
        }

        let p = &self.pipeline;
        if !(p.transcode_trigger_percent > 0.0 && p.transcode_trigger_percent <= 100.0) {
            return invalid("pipeline.transcode_trigger_percent must be in (0, 100]");
        }
        if p.poll_interval_ms == 0 {
            return invalid("pipeline.poll_interval_ms must be positive");
        }
        if p.backoff_max_ms == 0 {
            return invalid("pipeline.backoff_max_ms must be positive");
        }
        if p.max_poll_failures == 0 {
            return invalid("pipeline.max_poll_failures must be at least 1");
        }
        if p.stall_timeout_secs == 0 {
            return invalid("pipeline.stall_timeout_secs must be positive");
        }

        let r = &self.readiness;
        if !(0.0..=100.0).contains(&r.min_download_percent)
            || !(0.0..=100.0).contains(&r.min_transcoded_percent)
        {
            return invalid("readiness percentages must be in [0, 100]");
        }
        if Quality::ALL
            .iter()
            .any(|q| r.bitrates.for_quality(*q) == 0)
        {
            return invalid("readiness.bitrates must all be positive");
        }

        if self.transcode.ffmpeg.is_empty() {
            return invalid("transcode.ffmpeg cannot be empty");
        }
        if self.transcode.segment_secs == 0 {
            return invalid("transcode.segment_secs must be positive");
        }

        Ok(())
    }
}
