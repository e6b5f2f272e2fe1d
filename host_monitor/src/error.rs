//! Construction-time error taxonomy for samplers and the controller

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a sampler (or the whole run) before its loop starts.
///
/// Per-sample read failures never surface here; they null the affected
/// fields of a single row instead.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// A configuration value is out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The network backend selector names no known backend
    #[error("Unknown network backend `{0}` (expected `direct` or `bpftrace`)")]
    UnknownBackend(String),

    /// An interface include/exclude pattern failed to compile
    #[error("Invalid interface pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The filesystem path configured for disk usage cannot be queried
    #[error("Filesystem path {} is not usable: {source}", path.display())]
    InvalidPath {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// A required external binary is not on PATH
    #[error("`{0}` not found on PATH")]
    ExternalToolMissing(String),

    /// I/O error opening outputs or spawning processes
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
