use crate::paths::AppDirs;
use crate::reencode::BitrateLimits;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            logging: LoggingConfig::default(),
            encoder: EncoderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    #[serde(default = "default_stdout_enabled")]
    pub stdout: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            stdout: default_stdout_enabled(),
            file_name: None,
        }
    }
}

/// Settings for the re-encoding pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncoderConfig {
    /// x264 preset passed to the encoder.
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Bitrate used when a call does not ask for one (bits per second).
    #[serde(default = "default_bitrate")]
    pub default_bitrate: u64,
    #[serde(default = "default_min_bitrate")]
    pub min_bitrate: u64,
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate: u64,
    /// Size of the `ffmpeg-worker` pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            preset: default_preset(),
            default_bitrate: default_bitrate(),
            min_bitrate: default_min_bitrate(),
            max_bitrate: default_max_bitrate(),
            worker_threads: default_worker_threads(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

impl EncoderConfig {
    pub fn bitrate_limits(&self) -> BitrateLimits {
        BitrateLimits {
            min: self.min_bitrate,
            default: self.default_bitrate,
            max: self.max_bitrate,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("encoder bitrates must satisfy min <= default <= max (got {min} <= {default} <= {max})")]
    BitrateOrder { min: u64, default: u64, max: u64 },
    #[error("encoder.worker_threads must be at least 1")]
    NoWorkers,
    #[error("encoder.preset must not be empty")]
    EmptyPreset,
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }

        let encoder = &self.encoder;
        if !(encoder.min_bitrate <= encoder.default_bitrate
            && encoder.default_bitrate <= encoder.max_bitrate)
        {
            return Err(ValidationError::BitrateOrder {
                min: encoder.min_bitrate,
                default: encoder.default_bitrate,
                max: encoder.max_bitrate,
            });
        }
        if encoder.worker_threads == 0 {
            return Err(ValidationError::NoWorkers);
        }
        if encoder.preset.trim().is_empty() {
            return Err(ValidationError::EmptyPreset);
        }
        Ok(())
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_stdout_enabled() -> bool {
    true
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_bitrate() -> u64 {
    1_000_000
}

fn default_min_bitrate() -> u64 {
    100_000
}

fn default_max_bitrate() -> u64 {
    100_000_000
}

fn default_worker_threads() -> usize {
    2
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}
