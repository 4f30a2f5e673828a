mod cli;
mod commands;

use anyhow::Result;
use clap::{ArgAction, Parser};
use rangedl::{CancellationToken, DownloadSession, DownloaderConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::cli::VerifyMode;
use crate::commands::DownloadOptions;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Single URL to download (optional, if provided, tasks-file is ignored)
    #[arg(index = 1)]
    url: Option<String>,

    /// Path to the file containing URLs (one per line, optionally `url|sha256`)
    #[arg(short = 't', long = "tasks-file", default_value = "download.txt")]
    tasks_file: PathBuf,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    download_dir: PathBuf,

    /// Output file name for a single URL (defaults to the last path segment of the URL)
    #[arg(short = 'o', long)]
    name: Option<String>,

    /// Extension appended to the output file name (e.g. mp4, m4a)
    #[arg(short = 'e', long = "ext")]
    extension: Option<String>,

    /// Maximum number of files downloaded at once (defaults to number of logical CPUs)
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Number of parallel connections per file (1-120)
    #[arg(short = 's', long, visible_alias = "connections")]
    split: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Attempts after a failed download before giving up
    #[arg(long)]
    retries: Option<u32>,

    /// JSON file with downloader settings; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for part files (defaults to the download directory)
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Keep part files of failed downloads for inspection
    #[arg(long)]
    keep_parts: bool,

    /// Replace files that already exist
    #[arg(long, conflicts_with = "skip_existing")]
    overwrite: bool,

    /// Skip files that already exist instead of failing
    #[arg(long)]
    skip_existing: bool,

    /// Hash verification: auto (only when hash provided), on (require hash), off (skip)
    #[arg(long = "verify-hash", value_enum, default_value = "auto")]
    verify_hash: VerifyMode,

    /// Print text progress lines instead of progress bars
    #[arg(long)]
    plain_progress: bool,

    /// List completed downloads and stale part files
    #[arg(short = 'l', long)]
    list: bool,

    /// Remove stale part files from the download directory
    #[arg(long)]
    clean: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn downloader_config(&self) -> Result<DownloaderConfig> {
        let mut config = match &self.config {
            Some(path) => DownloaderConfig::load(path)?,
            None => DownloaderConfig::default(),
        };

        if let Some(split) = self.split {
            config.connections = split;
        }
        if self.rate_limit.is_some() {
            config.rate_limit = self.rate_limit;
        }
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        if self.temp_dir.is_some() {
            config.temp_dir = self.temp_dir.clone();
        }
        if self.keep_parts {
            config.keep_failed_parts = true;
        }

        config.validate()?;
        Ok(config)
    }

    fn download_options(&self, config: &DownloaderConfig) -> DownloadOptions {
        DownloadOptions {
            output: self.download_dir.clone(),
            connections: config.connections,
            overwrite: self.overwrite,
            skip_existing: self.skip_existing,
            extension: self.extension.clone(),
            verify_mode: self.verify_hash,
            plain_progress: self.plain_progress,
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let mut args = Args::parse();
    init_logging(args.verbose);

    // Resolve the output directory before anything changes the working directory
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    if args.list {
        return crate::commands::list_downloads(&args.download_dir).await;
    }
    if args.clean {
        let removed = crate::commands::clean_parts(&args.download_dir)?;
        println!("Removed {} stale part file(s)", removed);
        return Ok(());
    }

    let config = args.downloader_config()?;
    let options = args.download_options(&config);

    let cancel = CancellationToken::new();
    let session = Arc::new(DownloadSession::new(config)?.with_cancellation(cancel.clone()));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, cleaning up...");
            cancel.cancel();
        }
    });

    match args.url {
        Some(url) => crate::commands::run_single_download(&session, url, args.name, options).await,
        None => crate::commands::run_downloads(session, &args.tasks_file, options, args.concurrency).await,
    }
}
