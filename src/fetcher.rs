use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::DownloaderConfig;
use crate::error::{DownloadError, Result, TransportError};
use crate::planner::ByteRange;
use crate::progress::{ChunkCallback, ProgressAggregator};
use crate::transport::{BodyStream, Transport};

const WRITE_BUFFER: usize = 256 * 1024;

/// A segment that has been fully written to its part file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentResult {
    pub index: usize,
    pub temp_path: PathBuf,
    pub bytes_written: u64,
}

/// Global bytes-per-second cap shared by every segment of every job.
pub struct BandwidthLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    burst: NonZeroU32,
}

impl BandwidthLimiter {
    pub fn new(bytes_per_sec: u32) -> Option<Self> {
        let burst = NonZeroU32::new(bytes_per_sec)?;
        Some(Self {
            limiter: RateLimiter::direct(Quota::per_second(burst)),
            burst,
        })
    }

    /// Waits until `bytes` may be written. Amounts above the burst size are
    /// waited for in burst-sized steps.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let step = remaining.min(self.burst.get() as u64) as u32;
            let Some(n) = NonZeroU32::new(step) else {
                break;
            };
            // `n` never exceeds the burst, so capacity is always sufficient.
            let _ = self.limiter.until_n_ready(n).await;
            remaining -= step as u64;
        }
    }
}

/// Fetches a single byte range into its own part file.
#[derive(Clone)]
pub struct SegmentFetcher {
    transport: Arc<dyn Transport>,
    chunk_size: usize,
    read_timeout: Duration,
    rate_limiter: Option<Arc<BandwidthLimiter>>,
    on_chunk: Option<ChunkCallback>,
}

impl SegmentFetcher {
    pub fn new(transport: Arc<dyn Transport>, config: &DownloaderConfig) -> Self {
        Self {
            transport,
            chunk_size: config.chunk_size.max(1),
            read_timeout: config.read_timeout(),
            rate_limiter: None,
            on_chunk: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<BandwidthLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_chunk_callback(mut self, on_chunk: Option<ChunkCallback>) -> Self {
        self.on_chunk = on_chunk;
        self
    }

    /// Downloads `range` of `url` into `dest`, truncating any previous content.
    ///
    /// On a transfer or protocol error the part file stays on disk and the
    /// caller decides what to do with it. On cancellation it is removed.
    pub async fn fetch(
        &self,
        url: &str,
        index: usize,
        range: ByteRange,
        dest: &Path,
        progress: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> Result<SegmentResult> {
        debug!(index, start = range.start, end = range.end, "segment started");

        let result = self.fetch_inner(url, index, range, dest, progress, cancel).await;
        match &result {
            Ok(segment) => debug!(index, bytes = segment.bytes_written, "segment finished"),
            Err(DownloadError::Cancelled) => {
                let _ = fs::remove_file(dest).await;
                debug!(index, "segment cancelled");
            }
            Err(e) => debug!(index, error = %e, "segment failed"),
        }
        result
    }

    async fn fetch_inner(
        &self,
        url: &str,
        index: usize,
        range: ByteRange,
        dest: &Path,
        progress: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> Result<SegmentResult> {
        let file = File::create(dest).await?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = timeout(self.read_timeout, self.transport.get_range(url, range)) => match response {
                Ok(Ok(response)) => response,
                Ok(Err(source)) => return Err(DownloadError::Transfer { index, source }),
                Err(_) => {
                    return Err(DownloadError::Transfer {
                        index,
                        source: TransportError::Timeout(self.read_timeout),
                    })
                }
            },
        };
        if !response.is_partial() {
            debug!(index, status = response.status, "server answered without honoring the range");
        }

        let copied = self
            .copy_body(index, range, response.body, &mut writer, progress, cancel)
            .await;
        let flushed = writer.flush().await;
        let written = copied?;
        flushed?;

        if written != range.len() {
            return Err(DownloadError::Protocol {
                index,
                expected: range.len(),
                actual: written,
            });
        }

        Ok(SegmentResult {
            index,
            temp_path: dest.to_path_buf(),
            bytes_written: written,
        })
    }

    async fn copy_body(
        &self,
        index: usize,
        range: ByteRange,
        mut body: BodyStream,
        writer: &mut BufWriter<File>,
        progress: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let expected = range.len();
        let mut written = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = timeout(self.read_timeout, body.next()) => next,
            };

            let bytes = match next {
                Ok(Some(Ok(bytes))) => bytes,
                Ok(Some(Err(source))) => return Err(DownloadError::Transfer { index, source }),
                Ok(None) => break,
                Err(_) => {
                    return Err(DownloadError::Transfer {
                        index,
                        source: TransportError::Timeout(self.read_timeout),
                    })
                }
            };

            for chunk in bytes.chunks(self.chunk_size) {
                let len = chunk.len() as u64;
                if written + len > expected {
                    // The server is sending more than the range; stop reading.
                    return Err(DownloadError::Protocol {
                        index,
                        expected,
                        actual: written + len,
                    });
                }

                if let Some(limiter) = &self.rate_limiter {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = limiter.acquire(len) => {}
                    }
                }

                writer.write_all(chunk).await?;
                written += len;

                if let Some(on_chunk) = &self.on_chunk {
                    on_chunk(len);
                }
                progress.add(index, len);
                progress.report();
            }
        }

        Ok(written)
    }
}
