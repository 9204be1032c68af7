use std::path::Path;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

const READ_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of the integrity check of a completed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The digest matched the expected checksum.
    Verified,
    Mismatch { actual: String },
    /// No checksum to compare against, or verification switched off. The file
    /// is accepted without hashing and recorded as unverified.
    Trusted,
}

/// Compute SHA256 hash of a file asynchronously.
pub async fn sha256_sum(path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::with_capacity(READ_BUFFER, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 { break; }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether the file at `path` hashes to `expected` (hex, any case).
pub async fn verify_sha256(path: &Path, expected: &str) -> Result<bool, IntegrityError> {
    let sum = sha256_sum(path).await?;
    Ok(sum.eq_ignore_ascii_case(expected.trim()))
}

pub async fn check(
    path: &Path,
    expected: Option<&str>,
    enabled: bool,
) -> Result<Verdict, IntegrityError> {
    let expected = match expected {
        Some(sum) if enabled && !sum.trim().is_empty() => sum,
        _ => return Ok(Verdict::Trusted),
    };
    let actual = sha256_sum(path).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(Verdict::Verified)
    } else {
        Ok(Verdict::Mismatch { actual })
    }
}
