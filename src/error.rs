use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Connection table enumeration failed. The cycle is skipped.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed entry in {table} line {line}: {reason}")]
    Parse {
        table: &'static str,
        line: usize,
        reason: String,
    },

    #[error("enumeration did not finish within {0:?}")]
    Timeout(Duration),

    #[error("enumeration that timed out after {0:?} is still running")]
    StillRunning(Duration),

    #[error("enumeration task failed: {0}")]
    Join(String),

    #[error("OS call {call} failed with code {code}")]
    Os { call: &'static str, code: u32 },

    #[error("no connection table source for this platform")]
    Unsupported,
}

/// The persisted baseline could not be loaded.
#[derive(Error, Debug)]
pub enum BaselineError {
    /// The file exists but does not parse as a baseline.
    #[error("baseline {location} is corrupt: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("reading baseline {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
}

/// Writing the baseline failed. In-memory state is kept and the write is
/// retried next cycle.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("serializing baseline: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("writing baseline {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
}

/// Invalid startup configuration. Fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("writing alert to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encoding alert: {0}")]
    Serialize(#[from] serde_json::Error),
}
