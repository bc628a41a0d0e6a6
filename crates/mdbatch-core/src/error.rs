//! Error types for mdbatch core

use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the HTTP collaborator
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        headers: HeaderMap,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// HTTP status of a non-2xx response
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }

    /// Wait hint from `Retry-After`, in whole seconds
    ///
    /// `None` when the header is absent or not an integer.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Status { headers, .. } => headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
            _ => None,
        }
    }
}

/// Errors that can occur while resolving or transferring a batch
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Batch job manifest error: {message}")]
    Manifest {
        message: String,
        #[source]
        source: Option<TransportError>,
    },

    #[error("Cannot download {filename} over HTTPS, 'download' delivery is not available for this job")]
    DeliveryUnavailable { filename: String },

    #[error(
        "Batch file {} already exists and has a larger than expected size ({local_size} > {expected_size} bytes)",
        path.display()
    )]
    LocalConflict {
        path: PathBuf,
        local_size: u64,
        expected_size: u64,
    },

    #[error("Error downloading file {filename} after {attempts} attempts: {source}")]
    TransferExhausted {
        filename: String,
        attempts: u32,
        #[source]
        source: Box<BatchError>,
    },

    #[error("Rate limited by server")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Incomplete body for {filename}: have {received} of {expected} bytes")]
    IncompleteBody {
        filename: String,
        received: u64,
        expected: u64,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer task failed: {0}")]
    TaskFailed(String),

    #[error("Batch download was cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BatchError {
    pub(crate) fn manifest(message: impl Into<String>) -> Self {
        BatchError::Manifest {
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is handled by the generic retry channel
    pub fn is_retryable(&self) -> bool {
        match self {
            BatchError::Transport(e) => !e.is_rate_limited(),
            BatchError::Io(_) | BatchError::IncompleteBody { .. } => true,
            _ => false,
        }
    }
}
