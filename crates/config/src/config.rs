//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Job scheduling and retention configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// Number of jobs encoding at the same time (minimum 1)
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    /// Largest accepted source file, in megabytes
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,
    /// Minutes a finished job (and its output) is kept before cleanup
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u64,
    /// Directory for encoded outputs and per-job scratch files
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_max_concurrent_jobs() -> u32 {
    1
}

fn default_max_upload_mb() -> u64 {
    2048
}

fn default_retention_minutes() -> u64 {
    60
}

fn default_work_dir() -> PathBuf {
    env::temp_dir().join("smart-compressor")
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_upload_mb: default_max_upload_mb(),
            retention_minutes: default_retention_minutes(),
            work_dir: default_work_dir(),
        }
    }
}

/// External encoder tool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Path or name of the ffmpeg executable
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,
    /// Path or name of the ffprobe executable
    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: PathBuf,
    /// Probe encoders with a trial encode instead of trusting `ffmpeg -encoders`
    #[serde(default)]
    pub verify_encoders: bool,
    /// Upper bound for a single encoder pass, in seconds
    #[serde(default = "default_encode_timeout_secs")]
    pub encode_timeout_secs: u64,
    /// Time allowed for a killed encoder to exit, in seconds
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// Number of trailing diagnostic lines kept for failure messages
    #[serde(default = "default_diagnostic_tail_lines")]
    pub diagnostic_tail_lines: usize,
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_bin() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_encode_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_diagnostic_tail_lines() -> usize {
    20
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: default_ffmpeg_bin(),
            ffprobe_bin: default_ffprobe_bin(),
            verify_encoders: false,
            encode_timeout_secs: default_encode_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            diagnostic_tail_lines: default_diagnostic_tail_lines(),
        }
    }
}

/// Status server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Socket address the JSON status server binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:5333".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - COMPRESSOR_MAX_CONCURRENT_JOBS -> jobs.max_concurrent_jobs
    /// - COMPRESSOR_MAX_UPLOAD_MB -> jobs.max_upload_mb
    /// - COMPRESSOR_JOB_RETENTION_MINUTES -> jobs.retention_minutes
    /// - COMPRESSOR_WORK_DIR -> jobs.work_dir
    /// - COMPRESSOR_FFMPEG_BIN -> encoder.ffmpeg_bin
    /// - COMPRESSOR_FFPROBE_BIN -> encoder.ffprobe_bin
    /// - COMPRESSOR_VERIFY_ENCODERS -> encoder.verify_encoders
    /// - COMPRESSOR_ENCODE_TIMEOUT_SECS -> encoder.encode_timeout_secs
    /// - COMPRESSOR_BIND_ADDR -> server.bind_addr
    ///
    /// Values that fail to parse leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Some(jobs) = env_parse::<u32>("COMPRESSOR_MAX_CONCURRENT_JOBS") {
            self.jobs.max_concurrent_jobs = jobs;
        }

        if let Some(mb) = env_parse::<u64>("COMPRESSOR_MAX_UPLOAD_MB") {
            self.jobs.max_upload_mb = mb;
        }

        if let Some(minutes) = env_parse::<u64>("COMPRESSOR_JOB_RETENTION_MINUTES") {
            self.jobs.retention_minutes = minutes;
        }

        if let Ok(dir) = env::var("COMPRESSOR_WORK_DIR") {
            if !dir.is_empty() {
                self.jobs.work_dir = PathBuf::from(dir);
            }
        }

        if let Ok(bin) = env::var("COMPRESSOR_FFMPEG_BIN") {
            if !bin.is_empty() {
                self.encoder.ffmpeg_bin = PathBuf::from(bin);
            }
        }

        if let Ok(bin) = env::var("COMPRESSOR_FFPROBE_BIN") {
            if !bin.is_empty() {
                self.encoder.ffprobe_bin = PathBuf::from(bin);
            }
        }

        if let Ok(val) = env::var("COMPRESSOR_VERIFY_ENCODERS") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.encoder.verify_encoders = true,
                "false" | "0" | "no" => self.encoder.verify_encoders = false,
                _ => {}
            }
        }

        if let Some(secs) = env_parse::<u64>("COMPRESSOR_ENCODE_TIMEOUT_SECS") {
            self.encoder.encode_timeout_secs = secs;
        }

        if let Ok(addr) = env::var("COMPRESSOR_BIND_ADDR") {
            if !addr.is_empty() {
                self.server.bind_addr = addr;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for deployments without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Worker count actually used; zero is treated as one.
    pub fn effective_concurrency(&self) -> usize {
        self.jobs.max_concurrent_jobs.max(1) as usize
    }

    /// Upload limit in bytes
    pub fn max_upload_bytes(&self) -> u64 {
        self.jobs.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}
