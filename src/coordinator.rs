//! Worker pool and join barrier for the segments of one job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DownloadError, Result};
use crate::fetcher::{SegmentFetcher, SegmentResult};
use crate::planner::{validate_connections, ByteRange};
use crate::progress::ProgressAggregator;
use crate::source::MediaSource;
use crate::utils::part_path;

pub struct ParallelDownloadCoordinator {
    fetcher: SegmentFetcher,
    progress: Arc<ProgressAggregator>,
    cancel: CancellationToken,
    keep_failed_parts: bool,
}

impl ParallelDownloadCoordinator {
    pub fn new(fetcher: SegmentFetcher, progress: Arc<ProgressAggregator>, cancel: CancellationToken) -> Self {
        Self {
            fetcher,
            progress,
            cancel,
            keep_failed_parts: false,
        }
    }

    pub fn keep_failed_parts(mut self, keep: bool) -> Self {
        self.keep_failed_parts = keep;
        self
    }

    /// Fetches every range into `<output_prefix>.part<index>` with at most
    /// `connections` requests in flight.
    ///
    /// Returns only after every segment has finished one way or another.
    /// Results are ordered by range index. If any segment fails, the others
    /// are cancelled and awaited, their part files are removed, and the
    /// first error is returned.
    pub async fn run(
        &self,
        source: &MediaSource,
        ranges: &[ByteRange],
        output_prefix: &Path,
        connections: usize,
    ) -> Result<Vec<SegmentResult>> {
        validate_connections(connections)?;
        if ranges.is_empty() {
            return Err(DownloadError::InvalidConfiguration("no ranges to download".into()));
        }

        info!(
            url = source.url(),
            segments = ranges.len(),
            connections,
            "starting segmented download"
        );

        let semaphore = Arc::new(Semaphore::new(connections));
        // Child token: a failing segment stops its siblings without cancelling the caller.
        let abort = self.cancel.child_token();
        let part_paths: Vec<PathBuf> = (0..ranges.len()).map(|i| part_path(output_prefix, i)).collect();
        let mut workers = JoinSet::new();

        for (index, range) in ranges.iter().copied().enumerate() {
            let fetcher = self.fetcher.clone();
            let progress = self.progress.clone();
            let semaphore = semaphore.clone();
            let abort = abort.clone();
            let url = source.url().to_string();
            let dest = part_paths[index].clone();

            workers.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = abort.cancelled() => return (index, Err(DownloadError::Cancelled)),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return (index, Err(DownloadError::Cancelled)),
                    },
                };
                let result = fetcher.fetch(&url, index, range, &dest, &progress, &abort).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<SegmentResult>> = vec![None; ranges.len()];
        let mut first_error: Option<DownloadError> = None;

        while let Some(joined) = workers.join_next().await {
            let (index, outcome) = match joined {
                Ok((index, outcome)) => (Some(index), outcome),
                Err(e) => (None, Err(DownloadError::Join(e))),
            };

            match outcome {
                Ok(segment) => {
                    if let Some(index) = index {
                        results[index] = Some(segment);
                    }
                }
                Err(e) if first_error.is_none() => {
                    if !e.is_cancelled() {
                        warn!(segment = ?index, error = %e, "segment failed, stopping remaining segments");
                        abort.cancel();
                    }
                    first_error = Some(e);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(segment = ?index, error = %e, "discarding additional segment error"),
            }
        }

        self.progress.finish();

        if let Some(e) = first_error {
            self.cleanup(&part_paths).await;
            return Err(e);
        }

        results
            .into_iter()
            .enumerate()
            .map(|(index, segment)| {
                segment.ok_or_else(|| {
                    DownloadError::InvalidConfiguration(format!("segment {} produced no result", index))
                })
            })
            .collect()
    }

    async fn cleanup(&self, part_paths: &[PathBuf]) {
        for path in part_paths {
            if !path.exists() {
                continue;
            }
            if self.keep_failed_parts {
                warn!(path = %path.display(), "keeping part file of failed download");
                continue;
            }
            match fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "removed part file"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove part file"),
            }
        }
    }
}
