use crate::baseline::CorruptBaselinePolicy;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub filter: FilterConfig,
    pub alerts: AlertConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_seconds: u64,
    pub baseline_file: PathBuf,
    /// Consecutive polls a connection may be missing before it is evicted
    pub grace_polls: u32,
    /// Defaults to half the interval, at least one second
    pub snapshot_timeout_seconds: Option<u64>,
    pub on_corrupt_baseline: CorruptBaselinePolicy,
    /// Failed saves in a row tolerated before a durability alert
    pub persist_failure_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            interval_seconds: 5,
            baseline_file: PathBuf::from("known_connections.json"),
            grace_polls: 2,
            snapshot_timeout_seconds: None,
            on_corrupt_baseline: CorruptBaselinePolicy::StartEmpty,
            persist_failure_threshold: 3,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        match self.snapshot_timeout_seconds {
            Some(secs) => Duration::from_secs(secs),
            None => (self.interval() / 2).max(Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Track listening TCP sockets and unconnected UDP sockets
    pub include_listening: bool,
    pub ignore_loopback: bool,
    /// CIDR ranges of remote addresses never tracked
    pub ignore_networks: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AlertConfig {
    /// `console` (or absent) for log output only, otherwise a JSON-lines file
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertTarget {
    Console,
    JsonFile(PathBuf),
}

impl AlertConfig {
    pub fn target(&self) -> AlertTarget {
        match self.output.as_deref().map(str::trim) {
            None | Some("") | Some("-") | Some("console") => AlertTarget::Console,
            Some(path) => AlertTarget::JsonFile(PathBuf::from(path)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_file: Option<String>,
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<log::LevelFilter, ConfigError> {
        self.log_level
            .parse::<log::LevelFilter>()
            .map_err(|_| ConfigError::Invalid {
                field: "logging.log_level",
                reason: format!("unknown level {:?}", self.log_level),
            })
    }
}

/// Command-line values layered over the config file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub interval_seconds: Option<u64>,
    pub baseline_file: Option<PathBuf>,
    pub debug: bool,
    pub output: Option<String>,
    pub grace_polls: Option<u32>,
    pub abort_on_corrupt: bool,
    pub include_listening: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    /// File (or defaults) + overrides, validated.
    pub fn resolve(path: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(interval) = overrides.interval_seconds {
            self.monitor.interval_seconds = interval;
        }
        if let Some(file) = &overrides.baseline_file {
            self.monitor.baseline_file = file.clone();
        }
        if let Some(grace) = overrides.grace_polls {
            self.monitor.grace_polls = grace;
        }
        if overrides.abort_on_corrupt {
            self.monitor.on_corrupt_baseline = CorruptBaselinePolicy::Abort;
        }
        if overrides.include_listening {
            self.filter.include_listening = true;
        }
        if let Some(output) = &overrides.output {
            self.alerts.output = Some(output.clone());
        }
        if overrides.debug {
            self.logging.log_level = "debug".to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let monitor = &self.monitor;
        if monitor.interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "monitor.interval_seconds",
                reason: "must be greater than 0".to_string(),
            });
        }
        if monitor.grace_polls == 0 {
            return Err(ConfigError::Invalid {
                field: "monitor.grace_polls",
                reason: "must be at least 1".to_string(),
            });
        }
        if monitor.baseline_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "monitor.baseline_file",
                reason: "must not be empty".to_string(),
            });
        }
        if monitor.baseline_file.is_dir() {
            return Err(ConfigError::Invalid {
                field: "monitor.baseline_file",
                reason: format!("{} is a directory", monitor.baseline_file.display()),
            });
        }
        if let Some(timeout) = monitor.snapshot_timeout_seconds {
            if timeout == 0 || timeout > monitor.interval_seconds {
                return Err(ConfigError::Invalid {
                    field: "monitor.snapshot_timeout_seconds",
                    reason: format!(
                        "must be between 1 and the interval ({}s), got {}",
                        monitor.interval_seconds, timeout
                    ),
                });
            }
        }
        if let AlertTarget::JsonFile(path) = self.alerts.target() {
            if path.is_dir() {
                return Err(ConfigError::Invalid {
                    field: "alerts.output",
                    reason: format!("{} is a directory", path.display()),
                });
            }
        }
        self.logging.level()?;
        Ok(())
    }
}
