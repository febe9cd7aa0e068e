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

/// Stabilization tool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StabilizerConfig {
    /// User-configured executable path; takes priority over every other lookup
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Settings/preset file passed positionally after the source video
    #[serde(default)]
    pub preset_file: Option<PathBuf>,
    /// Parallel render hint (0 = derive from core count)
    #[serde(default)]
    pub parallelism: u32,
    /// Per-job deadline in seconds (0 = no deadline)
    #[serde(default)]
    pub job_timeout_secs: u64,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Directory that receives one rendered file per job
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
    /// Smallest output file (bytes) accepted when the tool reported an error
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("rendered")
}

fn default_min_output_bytes() -> u64 {
    1
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            min_output_bytes: default_min_output_bytes(),
        }
    }
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// Keep audio in the rendered clip (default true)
    #[serde(default = "default_audio_enabled")]
    pub enabled: bool,
    /// Force the alternate audio codec; works around encoder band-count limits
    #[serde(default)]
    pub alternate_codec: bool,
}

fn default_audio_enabled() -> bool {
    true
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: default_audio_enabled(),
            alternate_codec: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub stabilizer: StabilizerConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub audio: AudioConfig,
}

/// Parse a boolean environment value.
///
/// Accepts "true", "1", "yes" as true and "false", "0", "no" as false.
fn parse_env_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
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
    /// - STABILIZER_PATH -> stabilizer.executable
    /// - STABILIZER_PRESET_FILE -> stabilizer.preset_file
    /// - STABILIZER_PARALLELISM -> stabilizer.parallelism
    /// - STABILIZER_JOB_TIMEOUT_SECS -> stabilizer.job_timeout_secs
    /// - RENDER_OUTPUT_DIR -> output.directory
    /// - RENDER_MIN_OUTPUT_BYTES -> output.min_output_bytes
    /// - RENDER_AUDIO_ENABLED -> audio.enabled
    /// - RENDER_AUDIO_ALTERNATE_CODEC -> audio.alternate_codec
    ///
    /// Values that fail to parse leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("STABILIZER_PATH") {
            if !val.trim().is_empty() {
                self.stabilizer.executable = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("STABILIZER_PRESET_FILE") {
            if !val.trim().is_empty() {
                self.stabilizer.preset_file = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("STABILIZER_PARALLELISM") {
            if let Ok(parallelism) = val.parse::<u32>() {
                self.stabilizer.parallelism = parallelism;
            }
        }

        if let Ok(val) = env::var("STABILIZER_JOB_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.stabilizer.job_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("RENDER_OUTPUT_DIR") {
            if !val.trim().is_empty() {
                self.output.directory = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RENDER_MIN_OUTPUT_BYTES") {
            if let Ok(bytes) = val.parse::<u64>() {
                self.output.min_output_bytes = bytes;
            }
        }

        if let Some(enabled) = env::var("RENDER_AUDIO_ENABLED")
            .ok()
            .and_then(|v| parse_env_bool(&v))
        {
            self.audio.enabled = enabled;
        }

        if let Some(alternate) = env::var("RENDER_AUDIO_ALTERNATE_CODEC")
            .ok()
            .and_then(|v| parse_env_bool(&v))
        {
            self.audio.alternate_codec = alternate;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
