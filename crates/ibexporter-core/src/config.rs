//! Exporter configuration and startup validation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::names::NodeNameMapError;
use crate::reset::{DEFAULT_HIGH_WATER_RATIO, ResetPolicy};

pub const DEFAULT_PORT: u16 = 9683;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Base arguments of every `ibqueryerrors` run.
const IBQUERYERRORS_ARGS: &[&str] = &[
    "--verbose",
    "--details",
    "--suppress-common",
    "--data",
    "--report-port",
    "--switch",
    "--ca",
];

/// Errors detected before the exporter starts serving.
#[derive(Debug)]
pub enum ConfigError {
    /// `--from-file` does not point to a regular file.
    InputFileMissing(PathBuf),
    /// No input file and the diagnostic command is not an executable in PATH.
    CommandNotFound(String),
    /// High-water ratio outside `(0, 1]`.
    InvalidHighWaterRatio(f64),
    NodeNameMap(NodeNameMapError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InputFileMissing(path) => {
                write!(f, "{} is not a file", path.display())
            }
            ConfigError::CommandNotFound(program) => {
                write!(f, "{} not found in PATH or not executable", program)
            }
            ConfigError::InvalidHighWaterRatio(ratio) => {
                write!(f, "high-water ratio must be in (0, 1], got {}", ratio)
            }
            ConfigError::NodeNameMap(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::NodeNameMap(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NodeNameMapError> for ConfigError {
    fn from(e: NodeNameMapError) -> Self {
        ConfigError::NodeNameMap(e)
    }
}

/// Everything the scrape cycle needs to know about its environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExporterConfig {
    pub can_reset_counter: bool,
    /// Read the report from this file instead of running `ibqueryerrors`.
    pub input_file: Option<PathBuf>,
    pub node_name_map: Option<PathBuf>,
    /// Local adapter used for queries and resets.
    pub ca_name: Option<String>,
    pub command_timeout: Duration,
    pub high_water_ratio: f64,
    pub ibqueryerrors_path: String,
    pub perfquery_path: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            can_reset_counter: false,
            input_file: None,
            node_name_map: None,
            ca_name: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            high_water_ratio: DEFAULT_HIGH_WATER_RATIO,
            ibqueryerrors_path: "ibqueryerrors".to_string(),
            perfquery_path: "perfquery".to_string(),
        }
    }
}

impl ExporterConfig {
    /// Checks the configuration against the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.high_water_ratio > 0.0 && self.high_water_ratio <= 1.0) {
            return Err(ConfigError::InvalidHighWaterRatio(self.high_water_ratio));
        }
        match &self.input_file {
            Some(path) if !path.is_file() => Err(ConfigError::InputFileMissing(path.clone())),
            Some(_) => Ok(()),
            None if find_executable(&self.ibqueryerrors_path).is_none() => {
                Err(ConfigError::CommandNotFound(self.ibqueryerrors_path.clone()))
            }
            None => Ok(()),
        }
    }

    pub fn reset_policy(&self) -> ResetPolicy {
        ResetPolicy {
            enabled: self.can_reset_counter,
            high_water_ratio: self.high_water_ratio,
        }
    }

    /// Full argument list for `ibqueryerrors`.
    pub fn ibqueryerrors_args(&self) -> Vec<String> {
        let mut args: Vec<String> = IBQUERYERRORS_ARGS.iter().map(|s| s.to_string()).collect();
        if let Some(map) = &self.node_name_map {
            args.push("--node-name-map".to_string());
            args.push(map.display().to_string());
        }
        if let Some(ca) = &self.ca_name {
            args.push("--Ca".to_string());
            args.push(ca.clone());
        }
        args
    }
}

/// Resolves `program` to an executable file, searching PATH for bare names.
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
