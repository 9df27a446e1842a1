use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("I/O failure on '{}': {source}", path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed point record: expected {expected} bytes, got {actual}")]
    MalformedRecord { expected: usize, actual: usize },

    #[error("Failed to parse PLY: {0}")]
    MalformedPly(String),

    /// The message already carries the "Upload failed: " prefix.
    #[error("{0}")]
    TransportFailure(String),

    #[error("Conversion was cancelled")]
    Cancelled,

    #[error("A conversion is already running for '{0}'")]
    TargetBusy(String),

    #[error("Invalid conversion parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid settings: {0}")]
    Settings(String),
}

impl ConversionError {
    pub(crate) fn io_at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ConversionError::IoFailure {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn upload_failed(detail: impl std::fmt::Display) -> Self {
        ConversionError::TransportFailure(format!("Upload failed: {}", detail))
    }

    /// Classification used when the error terminates a job.
    pub fn kind(&self) -> FailureKind {
        match self {
            ConversionError::IoFailure { .. } => FailureKind::Io,
            ConversionError::TransportFailure(_) => FailureKind::Transport,
            ConversionError::Cancelled => FailureKind::Cancelled,
            ConversionError::InvalidDestination(_)
            | ConversionError::TargetBusy(_)
            | ConversionError::InvalidParameters(_)
            | ConversionError::Settings(_) => FailureKind::Precondition,
            ConversionError::MalformedRecord { .. } | ConversionError::MalformedPly(_) => {
                FailureKind::Internal
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Precondition,
    Io,
    Transport,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transport)
    }
}
