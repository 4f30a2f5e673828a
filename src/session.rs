use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DownloaderConfig;
use crate::coordinator::ParallelDownloadCoordinator;
use crate::error::{DownloadError, Result};
use crate::fetcher::{BandwidthLimiter, SegmentFetcher};
use crate::hashing;
use crate::planner::{plan, validate_connections};
use crate::progress::{ChunkCallback, ProgressAggregator, ProgressCallback};
use crate::reassembler::Reassembler;
use crate::source::MediaSource;
use crate::transport::{HttpTransport, Transport};
use crate::utils::{assembling_path, new_job_id, output_file_name, part_prefix};

/// One file to download. Built per call and dropped when the call returns.
#[derive(Clone)]
pub struct DownloadJob {
    pub url: String,
    pub title: String,
    pub extension: Option<String>,
    pub output_dir: PathBuf,
    pub overwrite: bool,
    pub connections: usize,
    pub expected_sha256: Option<String>,
    pub on_chunk: Option<ChunkCallback>,
    pub on_progress: Option<ProgressCallback>,
}

impl fmt::Debug for DownloadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadJob")
            .field("url", &self.url)
            .field("title", &self.title)
            .field("extension", &self.extension)
            .field("output_dir", &self.output_dir)
            .field("overwrite", &self.overwrite)
            .field("connections", &self.connections)
            .field("expected_sha256", &self.expected_sha256)
            .finish_non_exhaustive()
    }
}

impl DownloadJob {
    pub fn new(url: impl Into<String>, title: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            extension: None,
            output_dir: output_dir.into(),
            overwrite: false,
            connections: DownloaderConfig::default().connections,
            expected_sha256: None,
            on_chunk: None,
            on_progress: None,
        }
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn connections(mut self, connections: usize) -> Self {
        self.connections = connections;
        self
    }

    pub fn expected_sha256(mut self, hash: Option<String>) -> Self {
        self.expected_sha256 = hash;
        self
    }

    pub fn on_chunk(mut self, callback: ChunkCallback) -> Self {
        self.on_chunk = Some(callback);
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn file_name(&self) -> String {
        output_file_name(&self.title, self.extension.as_deref())
    }

    pub fn target_path(&self) -> PathBuf {
        self.output_dir.join(self.file_name())
    }
}

/// Runs download jobs: checks preconditions, probes the size, fetches the
/// segments in parallel and reassembles them.
pub struct DownloadSession {
    transport: Arc<dyn Transport>,
    config: DownloaderConfig,
    rate_limiter: Option<Arc<BandwidthLimiter>>,
    cancel: CancellationToken,
}

impl DownloadSession {
    pub fn new(config: DownloaderConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config).map_err(|e| {
            DownloadError::InvalidConfiguration(format!("failed to build HTTP client: {}", e))
        })?;
        Self::with_transport(Arc::new(transport), config)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, config: DownloaderConfig) -> Result<Self> {
        config.validate()?;
        let rate_limiter = config
            .rate_limit
            .and_then(BandwidthLimiter::new)
            .map(Arc::new);

        Ok(Self {
            transport,
            config,
            rate_limiter,
            cancel: CancellationToken::new(),
        })
    }

    /// Jobs stop as soon as `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Downloads `job` and returns the path of the finished file.
    pub async fn execute(&self, job: DownloadJob) -> Result<PathBuf> {
        validate_connections(job.connections)?;
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        if !job.output_dir.exists() {
            debug!(dir = %job.output_dir.display(), "creating output directory");
            fs::create_dir_all(&job.output_dir).await?;
        }

        let file_name = job.file_name();
        let final_path = job.output_dir.join(&file_name);
        if final_path.exists() {
            if !job.overwrite {
                return Err(DownloadError::AlreadyExists(final_path));
            }
            info!(path = %final_path.display(), "overwriting existing file");
            fs::remove_file(&final_path).await?;
        }

        let source = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            source = MediaSource::resolve(self.transport.as_ref(), &job.url) => source?,
        };
        let total = source.total_size();

        let connections = (job.connections as u64).min(total) as usize;
        if connections != job.connections {
            debug!(requested = job.connections, connections, total, "fewer bytes than connections, clamping");
        }
        let ranges = plan(total, connections)?;

        let job_id = new_job_id();
        let temp_dir = match &self.config.temp_dir {
            Some(dir) => {
                fs::create_dir_all(dir).await?;
                dir.clone()
            }
            None => job.output_dir.clone(),
        };
        let prefix = part_prefix(&temp_dir, &file_name, &job_id);

        info!(file = %file_name, bytes = total, connections, job = %job_id, "downloading");

        let progress = Arc::new(
            ProgressAggregator::new(ranges.len(), total)
                .with_callback(job.on_progress.clone(), self.config.progress_interval()),
        );
        let fetcher = SegmentFetcher::new(self.transport.clone(), &self.config)
            .with_rate_limiter(self.rate_limiter.clone())
            .with_chunk_callback(job.on_chunk.clone());
        let coordinator = ParallelDownloadCoordinator::new(fetcher, progress, self.cancel.clone())
            .keep_failed_parts(self.config.keep_failed_parts);

        let segments = coordinator.run(&source, &ranges, &prefix, connections).await?;

        let reassembler = Reassembler::new(assembling_path(&job.output_dir, &file_name, &job_id))
            .overwrite(job.overwrite);
        let path = reassembler.combine(&segments, &final_path, total).await?;

        if let Some(expected) = &job.expected_sha256 {
            let hash = hashing::verify_file(&path, expected).await?;
            debug!(path = %path.display(), sha256 = %hash, "hash verified");
        }

        Ok(path)
    }

    /// Runs `job` again after retryable failures, up to `retries` extra times.
    pub async fn execute_with_retry(&self, job: DownloadJob, retries: u32, delay: Duration) -> Result<PathBuf> {
        let mut attempt = 0;
        loop {
            match self.execute(job.clone()).await {
                Ok(path) => return Ok(path),
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    warn!(url = %job.url, attempt, retries, error = %e, "download failed, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const URL: &str = "https://cdn.example/videoplayback?id=1";

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    fn session(transport: Arc<MockTransport>) -> DownloadSession {
        let config = DownloaderConfig {
            chunk_size: 512,
            read_timeout_secs: 5,
            progress_interval_ms: 0,
            ..Default::default()
        };
        DownloadSession::with_transport(transport, config).unwrap()
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_execute_round_trip() {
        let dir = TempDir::new().unwrap();
        let data = payload(100_003);
        let transport = Arc::new(MockTransport::new(data.clone()).chunk_size(4096));

        let chunk_total = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (ct, sn) = (chunk_total.clone(), seen.clone());

        let job = DownloadJob::new(URL, "My: video?", dir.path())
            .extension("mp4")
            .connections(7)
            .on_chunk(Arc::new(move |len| {
                ct.fetch_add(len, Ordering::SeqCst);
            }))
            .on_progress(Arc::new(move |done, total| sn.lock().unwrap().push((done, total))));

        let path = session(transport.clone()).execute(job).await.unwrap();

        assert_eq!(path, dir.path().join("My video.mp4"));
        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert_eq!(entries(dir.path()), vec!["My video.mp4".to_string()]);
        assert_eq!(chunk_total.load(Ordering::SeqCst), 100_003);
        assert_eq!(transport.probe_calls(), 1);
        assert_eq!(transport.get_calls(), 7);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(*seen.last().unwrap(), (100_003, 100_003));
    }

    #[tokio::test]
    async fn test_existing_file_without_overwrite_touches_no_network() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"old").unwrap();
        let transport = Arc::new(MockTransport::new(payload(1000)));

        let job = DownloadJob::new(URL, "clip", dir.path()).extension("mp4");
        let err = session(transport.clone()).execute(job).await.unwrap_err();

        assert!(matches!(err, DownloadError::AlreadyExists(_)));
        assert_eq!(transport.network_calls(), 0);
        assert_eq!(std::fs::read(dir.path().join("clip.mp4")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_overwrite_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"old").unwrap();
        let data = payload(5000);
        let transport = Arc::new(MockTransport::new(data.clone()));

        let job = DownloadJob::new(URL, "clip", dir.path())
            .extension("mp4")
            .overwrite(true)
            .connections(3);
        let path = session(transport).execute(job).await.unwrap();

        assert_eq!(std::fs::read(path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_unknown_size() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new(payload(1000)).unknown_size());

        let job = DownloadJob::new(URL, "clip", dir.path().join("out"));
        let err = session(transport.clone()).execute(job).await.unwrap_err();

        assert!(matches!(err, DownloadError::UnknownSize { .. }));
        assert_eq!(transport.get_calls(), 0);
        assert!(entries(&dir.path().join("out")).is_empty());
    }

    #[tokio::test]
    async fn test_failed_segment_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(
            MockTransport::new(payload(40_000))
                .chunk_size(1000)
                .chunk_delay(Duration::from_millis(1))
                .fail_segment_at(20_000),
        );

        let job = DownloadJob::new(URL, "clip", dir.path()).extension("mp4").connections(4);
        let err = session(transport).execute(job).await.unwrap_err();

        assert!(matches!(err, DownloadError::Transfer { index: 2, .. }));
        assert!(err.is_retryable());
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_refused_segment_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(
            MockTransport::new(payload(40_000))
                .chunk_size(1000)
                .chunk_delay(Duration::from_millis(1))
                .refuse_segment_at(10_000),
        );

        let job = DownloadJob::new(URL, "clip", dir.path()).extension("mp4").connections(4);
        let err = session(transport).execute(job).await.unwrap_err();

        assert!(matches!(err, DownloadError::Transfer { index: 1, .. }));
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_read_timeout_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let config = DownloaderConfig {
            read_timeout_secs: 1,
            ..Default::default()
        };
        let transport = Arc::new(MockTransport::new(payload(8000)).stall());
        let session = DownloadSession::with_transport(transport, config).unwrap();

        let err = session
            .execute(DownloadJob::new(URL, "clip", dir.path()).connections(4))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DownloadError::Transfer { source: crate::error::TransportError::Timeout(_), .. }
        ));
        assert!(err.is_retryable());
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_racing_jobs_for_one_target() {
        let dir = TempDir::new().unwrap();
        let first = payload(50_000);
        let second: Vec<u8> = payload(30_000).into_iter().map(|b| b ^ 0xff).collect();
        let first_session = session(Arc::new(MockTransport::new(first.clone()).chunk_delay(Duration::from_millis(1))));
        let second_session = session(Arc::new(MockTransport::new(second.clone()).chunk_delay(Duration::from_millis(1))));

        // both pass the existence check before either has finished
        let (a, b) = tokio::join!(
            first_session.execute(DownloadJob::new(URL, "clip", dir.path()).connections(4)),
            second_session.execute(DownloadJob::new(URL, "clip", dir.path()).connections(4)),
        );

        let content = std::fs::read(dir.path().join("clip")).unwrap();
        match (a, b) {
            (Ok(path), Err(DownloadError::AlreadyExists(_))) => {
                assert_eq!(path, dir.path().join("clip"));
                assert_eq!(content, first);
            }
            (Err(DownloadError::AlreadyExists(_)), Ok(path)) => {
                assert_eq!(path, dir.path().join("clip"));
                assert_eq!(content, second);
            }
            (a, b) => panic!("expected exactly one AlreadyExists, got {:?} and {:?}", a, b),
        }
        assert_eq!(entries(dir.path()), vec!["clip".to_string()]);
    }

    #[tokio::test]
    async fn test_server_ignoring_ranges() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new(payload(10_000)).ignore_ranges());

        let job = DownloadJob::new(URL, "clip", dir.path()).connections(4);
        let err = session(transport).execute(job).await.unwrap_err();

        assert!(matches!(err, DownloadError::Protocol { .. }));
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_single_connection_tolerates_plain_200() {
        let dir = TempDir::new().unwrap();
        let data = payload(10_000);
        let transport = Arc::new(MockTransport::new(data.clone()).ignore_ranges());

        let job = DownloadJob::new(URL, "clip", dir.path()).connections(1);
        let path = session(transport).execute(job).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_tiny_resource_clamps_connections() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new(vec![1u8, 2, 3]));

        let job = DownloadJob::new(URL, "tiny", dir.path()).connections(16);
        let path = session(transport.clone()).execute(job).await.unwrap();

        assert_eq!(std::fs::read(path).unwrap(), vec![1u8, 2, 3]);
        assert_eq!(transport.get_calls(), 3);
    }

    #[tokio::test]
    async fn test_invalid_connections_fail_before_io() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new(payload(1000)));
        let out = dir.path().join("out");

        let job = DownloadJob::new(URL, "clip", &out).connections(121);
        let err = session(transport.clone()).execute(job).await.unwrap_err();

        assert!(matches!(err, DownloadError::InvalidConfiguration(_)));
        assert_eq!(transport.network_calls(), 0);
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_hash_mismatch_removes_output() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new(payload(2000)));

        let job = DownloadJob::new(URL, "clip", dir.path())
            .connections(2)
            .expected_sha256(Some("00".repeat(32)));
        let err = session(transport).execute(job).await.unwrap_err();

        assert!(matches!(err, DownloadError::HashMismatch { .. }));
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_dedicated_temp_dir() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("parts");
        let out = dir.path().join("out");
        let data = payload(9000);
        let config = DownloaderConfig {
            temp_dir: Some(temp.clone()),
            ..Default::default()
        };
        let session = DownloadSession::with_transport(Arc::new(MockTransport::new(data.clone())), config).unwrap();

        let path = session
            .execute(DownloadJob::new(URL, "clip", &out).connections(5))
            .await
            .unwrap();

        assert_eq!(std::fs::read(path).unwrap(), data);
        assert!(entries(&temp).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_jobs_share_output_dir() {
        let dir = TempDir::new().unwrap();
        let audio = payload(30_000);
        let video = payload(50_000);
        let audio_session = session(Arc::new(MockTransport::new(audio.clone()).chunk_delay(Duration::from_millis(1))));
        let video_session = session(Arc::new(MockTransport::new(video.clone()).chunk_delay(Duration::from_millis(1))));

        let (a, v) = tokio::join!(
            audio_session.execute(DownloadJob::new(URL, "AUDIO_clip", dir.path()).connections(4)),
            video_session.execute(DownloadJob::new(URL, "clip", dir.path()).connections(4)),
        );

        assert_eq!(std::fs::read(a.unwrap()).unwrap(), audio);
        assert_eq!(std::fs::read(v.unwrap()).unwrap(), video);
        assert_eq!(entries(dir.path()), vec!["AUDIO_clip".to_string(), "clip".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_session() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new(payload(8000)).stall());
        let cancel = CancellationToken::new();
        let session = session(transport).with_cancellation(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = session
            .execute(DownloadJob::new(URL, "clip", dir.path()).connections(4))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(entries(dir.path()).is_empty());

        // a cancelled session refuses further work
        let err = session
            .execute(DownloadJob::new(URL, "other", dir.path()))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_retry_repeats_retryable_failures() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new(payload(4000)).fail_segment_at(0));

        let job = DownloadJob::new(URL, "clip", dir.path()).connections(2);
        let err = session(transport.clone())
            .execute_with_retry(job, 2, Duration::from_millis(1))
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Transfer { index: 0, .. }));
        assert_eq!(transport.probe_calls(), 3);
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_failure() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("clip"), b"old").unwrap();
        let transport = Arc::new(MockTransport::new(payload(4000)));

        let job = DownloadJob::new(URL, "clip", dir.path());
        let err = session(transport.clone())
            .execute_with_retry(job, 5, Duration::from_millis(1))
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::AlreadyExists(_)));
        assert_eq!(transport.network_calls(), 0);
    }
}
