//! Progress aggregation for segmented downloads.
//!
//! Each segment worker owns one atomic slot and only ever adds to it, so
//! the sum over all slots never decreases. Callbacks are throttled and
//! emitted under a `try_lock`, which means a busy reporter makes writers
//! skip a report instead of waiting for it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indicatif::HumanBytes;

/// Called with the size of every chunk written by any segment.
pub type ChunkCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Called with `(bytes_downloaded, total_bytes)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Default)]
struct Emitter {
    last_at: Option<Instant>,
    last_value: u64,
}

pub struct ProgressAggregator {
    segments: Vec<AtomicU64>,
    total: u64,
    callback: Option<ProgressCallback>,
    interval: Duration,
    emitter: Mutex<Emitter>,
}

impl ProgressAggregator {
    pub fn new(segments: usize, total: u64) -> Self {
        Self {
            segments: (0..segments).map(|_| AtomicU64::new(0)).collect(),
            total,
            callback: None,
            interval: Duration::ZERO,
            emitter: Mutex::new(Emitter::default()),
        }
    }

    pub fn with_callback(mut self, callback: Option<ProgressCallback>, interval: Duration) -> Self {
        self.callback = callback;
        self.interval = interval;
        self
    }

    /// Adds `bytes` to the slot of segment `index`.
    pub fn add(&self, index: usize, bytes: u64) {
        if let Some(slot) = self.segments.get(index) {
            slot.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn segment_bytes(&self, index: usize) -> u64 {
        self.segments
            .get(index)
            .map(|slot| slot.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Bytes downloaded across all segments. May trail concurrent writers slightly.
    pub fn downloaded(&self) -> u64 {
        self.segments.iter().map(|slot| slot.load(Ordering::Relaxed)).sum()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Pushes the current figure to the callback, at most once per interval.
    pub fn report(&self) {
        self.emit(false);
    }

    /// Pushes the final figure regardless of throttling.
    pub fn finish(&self) {
        self.emit(true);
    }

    pub fn render(&self, width: usize) -> String {
        render_line(self.downloaded(), self.total, width)
    }

    fn emit(&self, force: bool) {
        let Some(callback) = &self.callback else {
            return;
        };

        let mut emitter = if force {
            match self.emitter.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            }
        } else {
            match self.emitter.try_lock() {
                Ok(guard) => guard,
                Err(_) => return,
            }
        };

        let now = Instant::now();
        if !force {
            if let Some(last) = emitter.last_at {
                if now.duration_since(last) < self.interval {
                    return;
                }
            }
        }

        // Emitted values stay ordered because they are produced under the lock.
        let downloaded = self.downloaded().max(emitter.last_value);
        emitter.last_at = Some(now);
        emitter.last_value = downloaded;
        callback(downloaded, self.total);
    }
}

/// Fixed-width text bar, e.g. `[=====>    ]  50.00% 512 B/1.00 KiB`.
pub fn render_line(downloaded: u64, total: u64, width: usize) -> String {
    let ratio = if total == 0 {
        0.0
    } else {
        (downloaded as f64 / total as f64).min(1.0)
    };
    let filled = ((ratio * width as f64).floor() as usize).min(width);

    let mut bar = "=".repeat(filled);
    if filled < width {
        bar.push('>');
        bar.push_str(&" ".repeat(width - filled - 1));
    }

    format!(
        "[{}] {:>6.2}% {}/{}",
        bar,
        ratio * 100.0,
        HumanBytes(downloaded),
        HumanBytes(total)
    )
}
