use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{DownloadError, Result};

pub async fn calculate_hash(filepath: &Path) -> Result<String> {
    let mut file = File::open(filepath).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Checks the SHA-256 of `filepath`, removing the file when it does not match.
pub async fn verify_file(filepath: &Path, expected: &str) -> Result<String> {
    let computed = calculate_hash(filepath).await?;
    if !expected.trim().eq_ignore_ascii_case(&computed) {
        let _ = tokio::fs::remove_file(filepath).await;
        return Err(DownloadError::HashMismatch {
            expected: expected.trim().to_string(),
            actual: computed,
        });
    }
    Ok(computed)
}
