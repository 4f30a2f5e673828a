use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{self, AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use crate::error::{DownloadError, Result};
use crate::fetcher::SegmentResult;

/// Concatenates part files, in range order, into the final file.
///
/// Output goes to a staging file next to the target and is only moved onto
/// `final_path` once its length matches `expected_total`, so a truncated
/// result never sits under the final name.
pub struct Reassembler {
    staging_path: PathBuf,
    overwrite: bool,
}

impl Reassembler {
    pub fn new(staging_path: PathBuf) -> Self {
        Self {
            staging_path,
            overwrite: false,
        }
    }

    /// Replace a file that appeared at the target while the job was running.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub async fn combine(
        &self,
        segments: &[SegmentResult],
        final_path: &Path,
        expected_total: u64,
    ) -> Result<PathBuf> {
        let result = self.write_staging(segments, expected_total).await;
        if let Err(e) = result {
            let _ = fs::remove_file(&self.staging_path).await;
            for segment in segments {
                let _ = fs::remove_file(&segment.temp_path).await;
            }
            return Err(e);
        }

        let placed = self.place(final_path).await;
        let _ = fs::remove_file(&self.staging_path).await;
        placed?;

        info!(path = %final_path.display(), bytes = expected_total, "download assembled");
        Ok(final_path.to_path_buf())
    }

    /// Moves the staging file onto `final_path`. Without overwrite the move
    /// never replaces an existing file.
    async fn place(&self, final_path: &Path) -> Result<()> {
        if self.overwrite {
            fs::rename(&self.staging_path, final_path).await?;
            return Ok(());
        }

        match fs::hard_link(&self.staging_path, final_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(DownloadError::AlreadyExists(final_path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_staging(&self, segments: &[SegmentResult], expected_total: u64) -> Result<()> {
        let declared: u64 = segments.iter().map(|s| s.bytes_written).sum();
        if declared != expected_total {
            return Err(DownloadError::Reassembly {
                expected: expected_total,
                actual: declared,
            });
        }

        let mut ordered: Vec<&SegmentResult> = segments.iter().collect();
        ordered.sort_by_key(|s| s.index);
        if ordered.iter().enumerate().any(|(i, s)| s.index != i) {
            return Err(DownloadError::InvalidConfiguration(
                "segment indices are not contiguous".into(),
            ));
        }

        let output = File::create(&self.staging_path).await?;
        let mut writer = BufWriter::new(output);
        let mut total = 0u64;

        for segment in ordered {
            let mut part = File::open(&segment.temp_path).await?;
            let copied = io::copy(&mut part, &mut writer).await?;
            drop(part);

            if copied != segment.bytes_written {
                return Err(DownloadError::Reassembly {
                    expected: expected_total,
                    actual: total + copied,
                });
            }
            total += copied;

            fs::remove_file(&segment.temp_path).await?;
            debug!(index = segment.index, bytes = copied, "segment appended");
        }

        writer.flush().await?;
        writer.get_ref().sync_all().await?;

        let on_disk = fs::metadata(&self.staging_path).await?.len();
        if total != expected_total || on_disk != expected_total {
            return Err(DownloadError::Reassembly {
                expected: expected_total,
                actual: on_disk,
            });
        }
        Ok(())
    }
}
