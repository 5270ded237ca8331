use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::collab::CollabError;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Quarantine write failed for {path}: {source}")]
    QuarantineIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Quarantine record already exists: {0}")]
    AlreadyQuarantined(String),

    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid malware signature `{name}`: {reason}")]
    InvalidSignature { name: String, reason: String },

    #[error("Collaborator failed: {0}")]
    Collaborator(#[from] CollabError),

    #[error("Analysis timed out after {0:?}")]
    Timeout(Duration),

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Analysis cancelled")]
    Cancelled,
}

impl IntakeError {
    pub fn quarantine_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IntakeError::QuarantineIo { path: path.into(), source }
    }
}

pub type IntakeResult<T> = Result<T, IntakeError>;
