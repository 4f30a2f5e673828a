use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use rangedl::utils::{get_filename_from_url, is_temporary_file, temporary_file_globs};
use rangedl::{render_line, DownloadJob, DownloadSession};

use crate::cli::VerifyMode;

#[derive(Clone, Debug, PartialEq)]
pub struct DownloadItem {
    pub url: String,
    pub hash: Option<String>,
}

/// Per-file settings taken from the command line.
#[derive(Clone, Debug)]
pub struct DownloadOptions {
    pub output: PathBuf,
    pub connections: usize,
    pub overwrite: bool,
    pub skip_existing: bool,
    pub extension: Option<String>,
    pub verify_mode: VerifyMode,
    pub plain_progress: bool,
}

/// Parses `url[|sha256]` lines. Blank lines and `#` comments are ignored.
pub fn parse_tasks(content: &str) -> Vec<DownloadItem> {
    let mut items = vec![];
    for line in content.lines() {
        let raw = line.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        let mut parts = raw.splitn(2, '|');
        let url = parts.next().unwrap_or_default().trim().to_string();
        let hash = parts.next().map(|h| h.trim().to_string()).filter(|s| !s.is_empty());
        if !url.is_empty() {
            items.push(DownloadItem { url, hash });
        }
    }
    items
}

/// Terminal output shared by every job of one invocation.
struct Reporter {
    multi_progress: MultiProgress,
    header_pb: ProgressBar,
    downloaded_files: Arc<AtomicUsize>,
    total_downloaded_bytes: Arc<AtomicU64>,
    total_files: usize,
    plain: bool,
    monitor: JoinHandle<()>,
}

impl Reporter {
    fn new(total_files: usize, plain: bool) -> Self {
        let multi_progress = MultiProgress::new();
        if plain {
            multi_progress.set_draw_target(ProgressDrawTarget::hidden());
        } else {
            multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
        }

        let header_pb = multi_progress.add(ProgressBar::new(0));
        header_pb.set_style(ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_bar()));
        header_pb.set_message(format!("Summary: Files: 0/{} | Downloaded: 0 B", total_files));

        let downloaded_files = Arc::new(AtomicUsize::new(0));
        let total_downloaded_bytes = Arc::new(AtomicU64::new(0));

        // Refresh the summary line periodically
        let df = downloaded_files.clone();
        let tdb = total_downloaded_bytes.clone();
        let hpb = header_pb.clone();
        let monitor = tokio::spawn(async move {
            loop {
                hpb.set_message(format!(
                    "Summary: Files: {}/{} | Downloaded: {}",
                    df.load(Ordering::Relaxed),
                    total_files,
                    HumanBytes(tdb.load(Ordering::Relaxed)),
                ));
                hpb.tick();
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        Self {
            multi_progress,
            header_pb,
            downloaded_files,
            total_downloaded_bytes,
            total_files,
            plain,
            monitor,
        }
    }

    /// Wires the job's callbacks to a new progress bar.
    fn instrument(&self, job: DownloadJob) -> (DownloadJob, ProgressBar) {
        let file_name = job.file_name();
        let pb = self.multi_progress.add(ProgressBar::new(0));
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
        );
        pb.set_message(format!("Downloading {}", file_name));

        let tdb = self.total_downloaded_bytes.clone();
        let job = job.on_chunk(Arc::new(move |len| {
            tdb.fetch_add(len, Ordering::Relaxed);
        }));

        let job = if self.plain {
            // One rewritten line only works while a single job is printing
            let inline = self.total_files == 1;
            job.on_progress(Arc::new(move |done, total| {
                eprint!("{}", plain_progress_line(done, total, &file_name, inline));
            }))
        } else {
            let bar = pb.clone();
            job.on_progress(Arc::new(move |done, total| {
                bar.set_length(total);
                bar.set_position(done);
            }))
        };

        (job, pb)
    }

    async fn skipped(&self, path: &Path) -> Result<()> {
        let metadata = fs::metadata(path).await?;
        let size = metadata.len();
        let modified: DateTime<Local> = metadata.modified()?.into();
        let file_name = path.file_name().unwrap_or_default().to_string_lossy();

        let message = format!(
            "{:>25} {:>17} Skipped {}",
            HumanBytes(size).to_string(),
            modified.format("%Y-%m-%d %H:%M").to_string(),
            file_name
        );
        if self.plain {
            eprintln!("{}", message);
        } else {
            let pb = self.multi_progress.add(ProgressBar::new(0));
            pb.set_style(
                ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            pb.finish_with_message(message);
        }
        self.downloaded_files.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Ends the rewritten plain progress line of a single job.
    fn end_line(&self) {
        if self.plain && self.total_files == 1 {
            eprintln!();
        }
    }

    fn completed(&self, pb: &ProgressBar, path: &Path) {
        self.end_line();
        let file_name = path.file_name().unwrap_or_default().to_string_lossy();
        pb.finish_with_message(format!("Completed   {}", file_name));
        self.downloaded_files.fetch_add(1, Ordering::Relaxed);
    }

    fn failed(&self, url: &str, error: &anyhow::Error) {
        self.multi_progress
            .suspend(|| eprintln!("Failed to download {}: {:#}", url, error));
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.monitor.abort();
        self.header_pb.tick();
    }
}

/// Downloads one item. Returns `None` when it was skipped.
async fn download_item(
    session: &DownloadSession,
    item: &DownloadItem,
    title: Option<String>,
    options: &DownloadOptions,
    reporter: &Reporter,
) -> Result<Option<PathBuf>> {
    let expected = options
        .verify_mode
        .expected_hash(item.hash.as_deref())
        .map_err(|e| anyhow!("{}: {}", e, item.url))?;
    let title = match title {
        Some(title) => title,
        None => get_filename_from_url(&item.url)?,
    };

    let mut job = DownloadJob::new(&item.url, title, &options.output)
        .overwrite(options.overwrite)
        .connections(options.connections)
        .expected_sha256(expected);
    if let Some(ext) = &options.extension {
        job = job.extension(ext.clone());
    }

    let target = job.target_path();
    if options.skip_existing && target.exists() {
        reporter.skipped(&target).await?;
        return Ok(None);
    }

    let (job, pb) = reporter.instrument(job);
    let config = session.config();
    let result = session
        .execute_with_retry(job, config.retries, config.retry_delay())
        .await
        .with_context(|| format!("Failed to download {}", item.url));

    match result {
        Ok(path) => {
            reporter.completed(&pb, &path);
            Ok(Some(path))
        }
        Err(e) => {
            reporter.end_line();
            pb.abandon_with_message(format!("Failed      {}", item.url));
            Err(e)
        }
    }
}

pub async fn run_single_download(
    session: &DownloadSession,
    url: String,
    title: Option<String>,
    options: DownloadOptions,
) -> Result<()> {
    if !options.output.exists() {
        fs::create_dir_all(&options.output).await.context("Failed to create output directory")?;
    }

    let reporter = Reporter::new(1, options.plain_progress);
    let item = DownloadItem { url, hash: None };

    let outcome = download_item(session, &item, title, &options, &reporter).await;
    drop(reporter);

    if let Some(path) = outcome? {
        println!("{}", path.display());
    }
    Ok(())
}

pub async fn run_downloads(
    session: Arc<DownloadSession>,
    input: &Path,
    options: DownloadOptions,
    concurrency: Option<usize>,
) -> Result<()> {
    if !options.output.exists() {
        fs::create_dir_all(&options.output).await.context("Failed to create output directory")?;
    }

    let content = fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to open input file: {:?}", input))?;
    let items = parse_tasks(&content);
    if items.is_empty() {
        bail!("No URLs found in {:?}", input);
    }

    if matches!(options.verify_mode, VerifyMode::On) {
        // Require hash for every item
        let missing: Vec<&str> = items
            .iter()
            .filter(|i| i.hash.is_none())
            .map(|i| i.url.as_str())
            .collect();
        if !missing.is_empty() {
            bail!("Hash verification is on, but these entries have no hash: {:?}", missing);
        }
    }

    let total_files = items.len();
    let reporter = Arc::new(Reporter::new(total_files, options.plain_progress));
    let options = Arc::new(options);
    let concurrency = concurrency.unwrap_or_else(num_cpus::get).max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut handles = vec![];

    for item in items {
        let session = session.clone();
        let semaphore = semaphore.clone();
        let reporter = reporter.clone();
        let options = options.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await?;
            let outcome = download_item(&session, &item, None, &options, &reporter).await;
            if let Err(e) = &outcome {
                reporter.failed(&item.url, e);
            }
            outcome.map(|path| (item.url, path))
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.await?);
    }
    drop(reporter);

    let failed = report_outcomes(&outcomes, &mut std::io::stdout().lock())?;

    if failed > 0 {
        bail!("{} of {} downloads failed", failed, total_files);
    }
    Ok(())
}

/// Prints the path of every saved file, one per line, and returns how many
/// items failed.
fn report_outcomes<W: Write>(outcomes: &[Result<(String, Option<PathBuf>)>], out: &mut W) -> io::Result<usize> {
    let mut failed = 0;
    for outcome in outcomes {
        match outcome {
            Ok((_, Some(path))) => writeln!(out, "{}", path.display())?,
            Ok((url, None)) => tracing::info!(url = %url, "skipped"),
            Err(_) => failed += 1,
        }
    }
    out.flush()?;
    Ok(failed)
}

/// Text progress for `--plain-progress`. Inline lines start with `\r` and are
/// overwritten by the next report; the reporter ends them once the job is done.
/// Otherwise every report is a line of its own.
fn plain_progress_line(done: u64, total: u64, file_name: &str, inline: bool) -> String {
    let line = format!("{} {}", render_line(done, total, 30), file_name);
    if inline {
        format!("\r{}", line)
    } else {
        format!("{}\n", line)
    }
}

pub async fn list_downloads(output: &Path) -> Result<()> {
    if !output.exists() {
        println!("Output directory '{:?}' does not exist.", output);
        println!("Tip: If you used a custom output directory, please specify it with --download-dir");
        return Ok(());
    }

    let mut completed = 0;
    let mut stale = 0;
    let mut completed_bytes: u64 = 0;
    let mut rows = vec![];

    let mut entries = fs::read_dir(output).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().into_owned();
        if filename == ".DS_Store" {
            continue;
        }

        let status = if is_temporary_file(&filename) {
            stale += 1;
            "Stale part"
        } else {
            completed += 1;
            completed_bytes += metadata.len();
            "Completed"
        };
        rows.push((filename, status, metadata.len()));
    }
    rows.sort();

    println!(
        "Summary: Completed: {} ({}) | Stale parts: {}",
        completed,
        HumanBytes(completed_bytes),
        stale
    );
    println!();

    if rows.is_empty() {
        println!("No completed downloads or part files found in '{:?}'.", output);
        return Ok(());
    }

    println!("{:<50} {:<15} {:<15}", "Filename", "Status", "Size");
    println!("{:-<50} {:-<15} {:-<15}", "", "", "");
    for (filename, status, size) in rows {
        println!("{:<50} {:<15} {:<15}", filename, status, HumanBytes(size).to_string());
    }
    if stale > 0 {
        println!();
        println!("Run with --clean to remove stale part files.");
    }

    Ok(())
}

/// Removes part and staging files left behind by interrupted jobs.
pub fn clean_parts(output: &Path) -> Result<usize> {
    let dir = glob::Pattern::escape(&output.to_string_lossy());
    let mut removed = 0;

    for pattern in temporary_file_globs() {
        let pattern = format!("{}/{}", dir, pattern);
        for entry in glob::glob(&pattern).context("Invalid glob pattern")? {
            let path = entry?;
            let is_part = path
                .file_name()
                .map(|name| is_temporary_file(&name.to_string_lossy()))
                .unwrap_or(false);
            if is_part && path.is_file() {
                std::fs::remove_file(&path).with_context(|| format!("Failed to remove {:?}", path))?;
                println!("Removed {}", path.display());
                removed += 1;
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_tasks() {
        let content = "\n# audio first\nhttps://a.example/a.m4a | ABCDEF\nhttps://a.example/v.mp4\n  \nhttps://a.example/x.webm|\n";
        let items = parse_tasks(content);
        assert_eq!(
            items,
            vec![
                DownloadItem { url: "https://a.example/a.m4a".into(), hash: Some("ABCDEF".into()) },
                DownloadItem { url: "https://a.example/v.mp4".into(), hash: None },
                DownloadItem { url: "https://a.example/x.webm".into(), hash: None },
            ]
        );
    }

    #[test]
    fn test_plain_progress_line() {
        let inline = plain_progress_line(100, 100, "clip.mp4", true);
        assert!(inline.starts_with('\r'));
        assert!(!inline.contains('\n'));

        let standalone = plain_progress_line(50, 100, "clip.mp4", false);
        assert!(standalone.ends_with("clip.mp4\n"));
        assert!(!standalone.contains('\r'));
    }

    #[test]
    fn test_report_outcomes_prints_saved_paths() {
        let outcomes = vec![
            Ok(("https://a.example/a.m4a".to_string(), Some(PathBuf::from("/out/a.m4a")))),
            Ok(("https://a.example/v.mp4".to_string(), None)),
            Err(anyhow!("Failed to download https://a.example/x.webm")),
            Ok(("https://a.example/b.mp4".to_string(), Some(PathBuf::from("/out/b.mp4")))),
        ];
        let mut out = Vec::new();

        let failed = report_outcomes(&outcomes, &mut out).unwrap();

        assert_eq!(failed, 1);
        assert_eq!(String::from_utf8(out).unwrap(), "/out/a.m4a\n/out/b.mp4\n");
    }

    #[test]
    fn test_clean_parts_only_removes_temporaries() {
        let dir = TempDir::new().unwrap();
        for name in [
            "clip.mp4",
            "clip.mp4.3f2a9c1b7d44.part0",
            "clip.mp4.3f2a9c1b7d44.part11",
            "clip.mp4.3f2a9c1b7d44.assembling",
            "notes.party",
            "Lecture.part2",
            "Lecture.3f2a9c1b7d44",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        assert_eq!(clean_parts(dir.path()).unwrap(), 3);

        let mut left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                "Lecture.3f2a9c1b7d44".to_string(),
                "Lecture.part2".to_string(),
                "clip.mp4".to_string(),
                "notes.party".to_string(),
            ]
        );
    }
}
