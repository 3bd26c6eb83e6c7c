//! Core configuration structures and loading logic

use crate::duration::{parse_duration, DurationError};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the output collection inside the default state directory
pub const DEFAULT_COLLECTION_FILE: &str = "outputs.jsonl";

/// State directory created under the watched root when no collection path is configured
pub const DEFAULT_STATE_DIR: &str = ".ofm-corrector";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A required option was not provided
    MissingField(&'static str),
    /// A duration option could not be parsed
    InvalidDuration {
        field: &'static str,
        source: DurationError,
    },
    /// An option has a value outside its allowed range
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::MissingField(field) => write!(f, "Missing required option: {}", field),
            ConfigError::InvalidDuration { field, source } => {
                write!(f, "Invalid duration for {}: {}", field, source)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "Invalid value for {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::InvalidDuration { source, .. } => Some(source),
            _ => None,
        }
    }
}

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

/// How a job's result folder is recognised as complete on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionCheck {
    /// The result folder exists
    #[default]
    OutputFolder,
    /// The result folder contains the completion marker written after aggregation
    MarkerFile,
}

/// Directory watching configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Root of the tree to scan (required)
    pub root: Option<PathBuf>,
    /// Substring identifying calibration (beads) files
    #[serde(default = "default_calibration_pattern")]
    pub calibration_pattern: String,
    /// Minimum time since last modification before a file is processed
    #[serde(default = "default_quiescence")]
    pub quiescence: String,
    /// Wait between two scans of the tree
    #[serde(default = "default_scan_interval")]
    pub scan_interval: String,
    /// Do not descend into directories whose name starts with '.'
    #[serde(default = "default_true")]
    pub skip_hidden_dirs: bool,
}

fn default_calibration_pattern() -> String {
    "Beads".to_string()
}

fn default_quiescence() -> String {
    "7h".to_string()
}

fn default_scan_interval() -> String {
    "1d".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: None,
            calibration_pattern: default_calibration_pattern(),
            quiescence: default_quiescence(),
            scan_interval: default_scan_interval(),
            skip_hidden_dirs: true,
        }
    }
}

/// External correction tool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrectionConfig {
    /// Fiji/ImageJ launcher binary
    #[serde(default = "default_launcher")]
    pub launcher: PathBuf,
    /// Groovy script run by the launcher
    #[serde(default = "default_script")]
    pub script: PathBuf,
    /// Flags placed between the launcher and `--run`
    #[serde(default = "default_flags")]
    pub flags: Vec<String>,
    /// Channel used as the fixed/reference channel
    #[serde(default)]
    pub reference_channel: u32,
}

fn default_launcher() -> PathBuf {
    PathBuf::from("ImageJ-linux64")
}

fn default_script() -> PathBuf {
    PathBuf::from("scripts/bUnwarpJ_code.groovy")
}

fn default_flags() -> Vec<String> {
    vec![
        "--ij2".to_string(),
        "--headless".to_string(),
        "--default-gc".to_string(),
    ]
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            launcher: default_launcher(),
            script: default_script(),
            flags: default_flags(),
            reference_channel: 0,
        }
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
    /// Maximum concurrent correction jobs (0 = auto-derive)
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    /// Threads hint handed to each job (0 = auto-derive)
    #[serde(default)]
    pub threads_per_job: u32,
}

fn default_max_concurrent_jobs() -> u32 {
    3
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            threads_per_job: 0,
        }
    }
}

/// Output collection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OutputConfig {
    /// JSON-lines file holding output records (defaults under the watched root)
    pub collection_path: Option<PathBuf>,
    /// Durable completion check used for restart-resume
    #[serde(default)]
    pub completion_check: CompletionCheck,
}

/// Status server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub correction: CorrectionConfig,
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing optional fields fall back to their defaults.
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
    /// - OFM_WATCH_ROOT -> watch.root
    /// - OFM_CALIBRATION_PATTERN -> watch.calibration_pattern
    /// - OFM_QUIESCENCE -> watch.quiescence
    /// - OFM_SCAN_INTERVAL -> watch.scan_interval
    /// - OFM_REFERENCE_CHANNEL -> correction.reference_channel
    /// - FIJI_LAUNCHER -> correction.launcher
    /// - OFM_MAX_CONCURRENT_JOBS -> workers.max_concurrent_jobs
    /// - OFM_THREADS_PER_JOB -> workers.threads_per_job
    /// - OFM_COLLECTION_PATH -> output.collection_path
    ///
    /// Numeric values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("OFM_WATCH_ROOT") {
            if !val.is_empty() {
                self.watch.root = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("OFM_CALIBRATION_PATTERN") {
            self.watch.calibration_pattern = val;
        }

        // Durations are validated later so a bad value is reported, not dropped
        if let Ok(val) = env::var("OFM_QUIESCENCE") {
            self.watch.quiescence = val;
        }

        if let Ok(val) = env::var("OFM_SCAN_INTERVAL") {
            self.watch.scan_interval = val;
        }

        if let Ok(val) = env::var("OFM_REFERENCE_CHANNEL") {
            if let Ok(channel) = val.parse::<u32>() {
                self.correction.reference_channel = channel;
            }
        }

        if let Ok(val) = env::var("FIJI_LAUNCHER") {
            if !val.is_empty() {
                self.correction.launcher = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("OFM_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.workers.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("OFM_THREADS_PER_JOB") {
            if let Ok(threads) = val.parse::<u32>() {
                self.workers.threads_per_job = threads;
            }
        }

        if let Ok(val) = env::var("OFM_COLLECTION_PATH") {
            if !val.is_empty() {
                self.output.collection_path = Some(PathBuf::from(val));
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Check every option that can only be judged as a whole
    ///
    /// Called once at startup; any error here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.watch_root()?;
        self.quiescence()?;
        self.scan_interval()?;

        if self.watch.calibration_pattern.is_empty() {
            return Err(ConfigError::Invalid {
                field: "watch.calibration_pattern",
                reason: "pattern must not be empty".to_string(),
            });
        }

        if self.server.enabled && self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid {
                field: "server.bind",
                reason: format!("'{}' is not a socket address", self.server.bind),
            });
        }

        Ok(())
    }

    /// Watched root directory
    pub fn watch_root(&self) -> Result<&Path, ConfigError> {
        match self.watch.root.as_deref() {
            Some(root) if !root.as_os_str().is_empty() => Ok(root),
            _ => Err(ConfigError::MissingField("watch.root")),
        }
    }

    /// Parsed file quiescence duration
    pub fn quiescence(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.watch.quiescence).map_err(|source| ConfigError::InvalidDuration {
            field: "watch.quiescence",
            source,
        })
    }

    /// Parsed wait between scans
    pub fn scan_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.watch.scan_interval).map_err(|source| {
            ConfigError::InvalidDuration {
                field: "watch.scan_interval",
                source,
            }
        })
    }

    /// Location of the output collection file
    ///
    /// Falls back to `<root>/.ofm-corrector/outputs.jsonl`.
    pub fn collection_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.output.collection_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self
                .watch_root()?
                .join(DEFAULT_STATE_DIR)
                .join(DEFAULT_COLLECTION_FILE)),
        }
    }
}
