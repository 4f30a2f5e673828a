use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, DownloadError>;

/// Failures raised by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {0}")]
    Status(u16),
    #[error("no data received for {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Every way a download job can fail.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Bad connection count, chunk size or range parameters. Raised before any I/O.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Target file is present and overwrite was not requested.
    #[error("file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// The resource length could not be determined, so the download cannot be planned.
    #[error("could not determine the size of {url}")]
    UnknownSize { url: String },

    /// The size probe itself failed.
    #[error("size probe for {url} failed: {source}")]
    Probe {
        url: String,
        #[source]
        source: TransportError,
    },

    /// The resolved stream is missing data required to download it.
    #[error("missing stream data: {0}")]
    MissingStreamData(String),

    /// Network or transport failure while fetching a segment.
    #[error("segment {index} failed: {source}")]
    Transfer {
        index: usize,
        #[source]
        source: TransportError,
    },

    /// The server did not honor the requested byte range.
    #[error("segment {index}: expected {expected} bytes, server sent {actual}")]
    Protocol {
        index: usize,
        expected: u64,
        actual: u64,
    },

    /// The combined output does not match the expected total.
    #[error("reassembled {actual} bytes, expected {expected}")]
    Reassembly { expected: u64, actual: u64 },

    /// Final file digest differs from the expected one.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DownloadError {
    /// Whether running the whole job again may succeed.
    ///
    /// Used by the outer retry loop; the core never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Transfer { .. }
                | DownloadError::Probe { .. }
                | DownloadError::Protocol { .. }
                | DownloadError::Reassembly { .. }
                | DownloadError::HashMismatch { .. }
                | DownloadError::Io(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}
