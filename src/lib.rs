//! Segmented parallel HTTP downloader.
//!
//! A [`DownloadSession`] probes a media URL for its size, splits it into
//! byte ranges, fetches every range over its own connection into a part
//! file and concatenates the parts in range order into the final file.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod hashing;
pub mod planner;
pub mod progress;
pub mod reassembler;
pub mod session;
pub mod source;
pub mod transport;
pub mod utils;

pub use config::DownloaderConfig;
pub use error::{DownloadError, Result, TransportError};
pub use planner::{plan, ByteRange, MAX_CONNECTIONS};
pub use progress::{render_line, ChunkCallback, ProgressCallback};
pub use session::{DownloadJob, DownloadSession};
pub use source::MediaSource;
pub use tokio_util::sync::CancellationToken;
