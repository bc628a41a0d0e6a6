//! Integrity verification of completed files
//!
//! Never fails a transfer. Mismatches and unsupported algorithms become
//! warnings and the file is kept.

use crate::engine::reporter::Reporter;
use mdbatch_types::{TransferTarget, TransferWarning};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

const READ_BUFFER: usize = 64 * 1024;

/// Parsed `<algorithm>:<hex digest>` string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumSpec<'a> {
    Sha256(&'a str),
    Unsupported(&'a str),
}

impl<'a> ChecksumSpec<'a> {
    pub fn parse(hash: &'a str) -> Self {
        match hash.split_once(':') {
            Some((algorithm, digest)) if algorithm.eq_ignore_ascii_case("sha256") => {
                ChecksumSpec::Sha256(digest)
            }
            Some((algorithm, _)) => ChecksumSpec::Unsupported(algorithm),
            None => ChecksumSpec::Unsupported(hash),
        }
    }
}

/// How a completed file compared with its manifest hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Mismatch { actual: String },
    Unsupported { algorithm: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Check `path` against the target's hash, reporting any warning
    pub async fn verify(&self, target: &TransferTarget, path: &Path, reporter: &Reporter) -> Verification {
        let filename = target.filename().to_string();
        let verification = match ChecksumSpec::parse(target.content_hash()) {
            ChecksumSpec::Sha256(expected) => match sha256_file(path).await {
                Ok(actual) if actual.eq_ignore_ascii_case(expected) => Verification::Verified,
                Ok(actual) => Verification::Mismatch { actual },
                Err(e) => Verification::Skipped {
                    reason: e.to_string(),
                },
            },
            ChecksumSpec::Unsupported(algorithm) => Verification::Unsupported {
                algorithm: algorithm.to_string(),
            },
        };

        match &verification {
            Verification::Verified => debug!("{} passed checksum validation", filename),
            Verification::Mismatch { actual } => reporter.warn(TransferWarning::ChecksumMismatch {
                filename,
                expected: target.content_hash().to_string(),
                actual: format!("sha256:{}", actual),
            }),
            Verification::Unsupported { algorithm } => {
                reporter.warn(TransferWarning::UnsupportedChecksum {
                    filename,
                    algorithm: algorithm.clone(),
                })
            }
            Verification::Skipped { reason } => reporter.warn(TransferWarning::VerificationSkipped {
                filename,
                reason: reason.clone(),
            }),
        }

        verification
    }
}

/// Lowercase hex SHA-256 of a file
pub async fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
