//! Collaborator seams used by the transfer engine
//!
//! The engine never talks to `reqwest` directly. It fetches manifests through
//! [`ManifestSource`] and file bodies through [`HttpTransport`], so tests can
//! substitute an in-memory server.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use url::Url;

/// Streamed response body
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Inclusive byte range for a `Range` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Value for the `Range` header
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A successful (2xx) file response
pub struct FileResponse {
    /// The server answered `206 Partial Content`
    pub partial: bool,
    pub body: ByteStream,
}

/// Source of raw job manifests (`batch.list_files`)
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn list_files(&self, job_id: &str) -> Result<Vec<serde_json::Value>, TransportError>;
}

/// "Fetch bytes with range support" primitive
///
/// Implementations translate every non-2xx response into
/// [`TransportError::Status`] so that 429 can be told apart from other failures.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &Url, range: Option<ByteRange>) -> Result<FileResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header_is_inclusive() {
        // Resuming the last byte of a 100 byte file
        let range = ByteRange::new(99, 99);
        assert_eq!(range.header_value(), "bytes=99-99");
        assert_eq!(range.to_string(), "99-99");
    }
}
