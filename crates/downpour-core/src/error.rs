//! Error types for the Downpour engine

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the download engine.
#[derive(Debug, Error)]
pub enum DownpourError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("Received html contents instead of media data")]
    HtmlBody,

    #[error("Transfer too slow: below {limit} B/s for {seconds} s")]
    LowSpeed { limit: u64, seconds: u64 },

    #[error("Unsupported protocol or encryption: {0}")]
    Unsupported(String),

    #[error("Destination not writable: {path}: {cause}")]
    Destination { path: PathBuf, cause: String },

    #[error("Target file already exists: {0}")]
    TargetExists(PathBuf),

    #[error("Progress journal error: {0}")]
    Journal(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Muxer failed: {0}")]
    Muxer(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl DownpourError {
    /// Transient errors are pushed to the scheduler's error channel and the
    /// segment is retried; everything else fails the item.
    pub fn is_transient(&self) -> bool {
        match self {
            DownpourError::Network(_)
            | DownpourError::HtmlBody
            | DownpourError::LowSpeed { .. } => true,
            DownpourError::Server { status, .. } => (400..512).contains(status),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DownpourError>;
