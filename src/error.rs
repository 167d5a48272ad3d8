use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Malformed job message: {0}")]
    MalformedJob(String),

    #[error("Failed to spawn job {job_id}: {source}")]
    Spawn {
        job_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Artifact transfer of {path} failed: {reason}")]
    ArtifactTransfer { path: PathBuf, reason: String },

    #[error("Job {job_id} finished without writing {path}")]
    OutputMissing { job_id: String, path: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BatchError {
    /// Connection-level faults the daemon recovers from by reconnecting.
    pub fn is_transport(&self) -> bool {
        matches!(self, BatchError::Transport(_))
    }
}

impl From<lapin::Error> for BatchError {
    fn from(e: lapin::Error) -> Self {
        BatchError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(e: serde_json::Error) -> Self {
        BatchError::MalformedJob(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
