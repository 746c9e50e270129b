//! Error types for log storage and process lifecycle operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors setting up a process log file. These abort startup.
#[derive(Debug, Error)]
pub enum LogError {
    /// The log directory could not be created.
    #[error("failed to create log directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The log file could not be opened.
    #[error("failed to open log file {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The log file could not be emptied.
    #[error("failed to truncate log file {}: {source}", path.display())]
    Truncate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from install/start/stop on a managed process.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Log setup failed.
    #[error(transparent)]
    Log(#[from] LogError),

    /// `start` was called while a previous run is still unresolved.
    #[error("process already running: {0}")]
    AlreadyRunning(String),
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;
