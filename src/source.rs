use tracing::debug;

use crate::error::{DownloadError, Result};
use crate::transport::Transport;

/// A direct media URL with a known length. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    url: String,
    total_size: u64,
}

impl MediaSource {
    pub fn new(url: impl Into<String>, total_size: u64) -> Result<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(DownloadError::MissingStreamData("stream has no url".into()));
        }
        if total_size == 0 {
            return Err(DownloadError::UnknownSize { url });
        }
        Ok(Self { url, total_size })
    }

    /// Probes `url` for its length with a metadata-only request.
    pub async fn resolve(transport: &dyn Transport, url: &str) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(DownloadError::MissingStreamData("stream has no url".into()));
        }
        url::Url::parse(url).map_err(|e| {
            DownloadError::InvalidConfiguration(format!("invalid url {}: {}", url, e))
        })?;

        let size = transport
            .content_length(url)
            .await
            .map_err(|source| DownloadError::Probe {
                url: url.to_string(),
                source,
            })?;
        debug!(url, ?size, "probed media size");

        Self::new(url, size.unwrap_or(0))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}
