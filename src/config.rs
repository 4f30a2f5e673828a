use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, Result};
use crate::planner::validate_connections;

pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Tunables shared by every job a session runs.
///
/// Loaded from an optional JSON file and then overridden from the command line.
/// Missing fields fall back to [`Default`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Parallel ranged requests per file.
    pub connections: usize,
    /// Bytes handed to the file and to `on_chunk` at a time.
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    /// Longest wait for the next piece of a response body.
    pub read_timeout_secs: u64,
    /// Global cap in bytes per second across all segments.
    pub rate_limit: Option<u32>,
    /// Directory for part files; defaults to the output directory.
    pub temp_dir: Option<PathBuf>,
    /// Leave part files of a failed job on disk for inspection.
    pub keep_failed_parts: bool,
    /// Extra attempts the command line makes after a retryable failure.
    pub retries: u32,
    pub retry_delay_secs: u64,
    /// Minimum spacing between `on_progress` calls.
    pub progress_interval_ms: u64,
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            connections: 8,
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            rate_limit: None,
            temp_dir: None,
            keep_failed_parts: false,
            retries: 4,
            retry_delay_secs: 3,
            progress_interval_ms: 100,
            user_agent: concat!("rangedl/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DownloaderConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_connections(self.connections)?;
        if self.chunk_size == 0 {
            return Err(DownloadError::InvalidConfiguration(
                "chunk_size must be greater than 0".into(),
            ));
        }
        if self.read_timeout_secs == 0 {
            return Err(DownloadError::InvalidConfiguration(
                "read_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.rate_limit == Some(0) {
            return Err(DownloadError::InvalidConfiguration(
                "rate_limit must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}
