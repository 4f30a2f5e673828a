use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, Result};

/// Upper bound on concurrent connections per job.
pub const MAX_CONNECTIONS: usize = 120;

/// Inclusive byte range of a resource.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for the HTTP `Range` header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Checks a connection count against the global bound.
pub fn validate_connections(connections: usize) -> Result<()> {
    if connections == 0 || connections > MAX_CONNECTIONS {
        return Err(DownloadError::InvalidConfiguration(format!(
            "connections must be between 1 and {}, got {}",
            MAX_CONNECTIONS, connections
        )));
    }
    Ok(())
}

/// Splits `[0, total_size)` into `connections` contiguous ranges.
///
/// Every range but the last is `total_size / connections` bytes long; the
/// last one absorbs the remainder. Ranges come back in ascending order.
pub fn plan(total_size: u64, connections: usize) -> Result<Vec<ByteRange>> {
    validate_connections(connections)?;
    if total_size == 0 {
        return Err(DownloadError::InvalidConfiguration(
            "cannot plan a download of 0 bytes".into(),
        ));
    }
    if connections as u64 > total_size {
        return Err(DownloadError::InvalidConfiguration(format!(
            "{} connections would produce empty ranges for a {} byte resource",
            connections, total_size
        )));
    }

    let part_size = total_size / connections as u64;
    let mut ranges = Vec::with_capacity(connections);

    for i in 0..connections {
        let start = i as u64 * part_size;
        let end = if i == connections - 1 {
            total_size - 1
        } else {
            start + part_size - 1
        };
        ranges.push(ByteRange::new(start, end));
    }

    Ok(ranges)
}
