//! Streaming SHA-256 content hashing.

use crate::error::{MediaCacheError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Read buffer size.
const CHUNK_SIZE: usize = 1024 * 1024;

/// Digest of a file's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    /// Lowercase hex SHA-256.
    pub sha256: String,
    /// Number of bytes hashed.
    pub size_bytes: u64,
}

/// Hash a file in one streaming pass.
pub fn compute_digest(path: impl AsRef<Path>) -> Result<ContentDigest> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| MediaCacheError::io_with_path(e, path))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut size_bytes: u64 = 0;
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| MediaCacheError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        size_bytes += bytes_read as u64;
    }

    Ok(ContentDigest {
        sha256: hex::encode(hasher.finalize()),
        size_bytes,
    })
}

/// [`compute_digest`] on the blocking pool.
pub async fn digest_file(path: impl Into<PathBuf>) -> Result<ContentDigest> {
    let path = path.into();
    tokio::task::spawn_blocking(move || compute_digest(&path))
        .await
        .map_err(|e| MediaCacheError::Other(format!("Hash computation task failed: {}", e)))?
}

/// Check that `path` still hashes to `expected`.
pub async fn verify_digest(path: impl Into<PathBuf>, expected: &str) -> Result<bool> {
    let digest = digest_file(path).await?;
    Ok(digest.sha256.eq_ignore_ascii_case(expected))
}
