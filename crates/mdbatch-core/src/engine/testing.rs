//! In-memory batch server used by the engine tests

use crate::error::TransportError;
use crate::transport::{ByteRange, FileResponse, HttpTransport, ManifestSource};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mdbatch_types::TransferTarget;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use url::Url;

const CHUNK: usize = 64;

/// Canned reply returned instead of serving the file
pub enum Reply {
    Status(u16),
    RateLimited(Option<&'static str>),
    /// Connection refused before any byte
    Refused,
    /// Sends `n` bytes of the requested body, then the connection drops
    DropAfter(usize),
    /// Answers a ranged request with the full body and `200`
    IgnoreRange,
    /// Sends `n` bytes of the requested body, then never sends another
    Stall(usize),
    /// The transport itself panics
    Panic,
}

#[derive(Default)]
pub struct MockServer {
    manifest: Mutex<Vec<Value>>,
    manifest_error: Mutex<Option<u16>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<(String, Option<ByteRange>)>>,
}

pub fn url_for(filename: &str) -> Url {
    Url::parse(&format!("https://files.test/job/{}", filename)).unwrap()
}

pub fn sha256_tag(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Deterministic content of `len` bytes
pub fn content(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

pub fn target(filename: &str, data: &[u8]) -> TransferTarget {
    TransferTarget::new(filename, sha256_tag(data), url_for(filename), data.len() as u64)
}

pub fn entry(filename: &str, hash: &str, size: u64) -> Value {
    json!({
        "filename": filename,
        "hash": hash,
        "size": size,
        "urls": { "https": url_for(filename).to_string(), "ftp": "ftp://files.test/x" },
    })
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `data` for `filename` and list it in the manifest
    pub fn with_file(self, filename: &str, hash: &str, data: Vec<u8>) -> Self {
        self.manifest.lock().push(entry(filename, hash, data.len() as u64));
        self.files.lock().insert(url_for(filename).to_string(), data);
        self
    }

    pub fn with_manifest(self, entries: Vec<Value>) -> Self {
        *self.manifest.lock() = entries;
        self
    }

    pub fn fail_manifest(self, status: u16) -> Self {
        *self.manifest_error.lock() = Some(status);
        self
    }

    pub fn serve(&self, filename: &str, data: Vec<u8>) {
        self.files.lock().insert(url_for(filename).to_string(), data);
    }

    /// Queue replies consumed by the next requests for `filename`
    pub fn script(&self, filename: &str, replies: Vec<Reply>) {
        self.replies
            .lock()
            .entry(url_for(filename).to_string())
            .or_default()
            .extend(replies);
    }

    pub fn requests(&self) -> Vec<(String, Option<ByteRange>)> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, filename: &str) -> Vec<Option<ByteRange>> {
        let url = url_for(filename).to_string();
        self.requests
            .lock()
            .iter()
            .filter(|(u, _)| *u == url)
            .map(|(_, r)| *r)
            .collect()
    }

    fn status(status: u16, retry_after: Option<&'static str>) -> TransportError {
        let mut headers = HeaderMap::new();
        if let Some(value) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(value));
        }
        TransportError::Status {
            status,
            headers,
            message: String::new(),
        }
    }

    fn body(data: Vec<u8>, drop_after: Option<usize>) -> crate::transport::ByteStream {
        let cut = drop_after.unwrap_or(data.len()).min(data.len());
        let mut chunks: Vec<Result<Bytes, TransportError>> = data[..cut]
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        if drop_after.is_some() {
            chunks.push(Err(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset,
            ))));
        }
        futures::stream::iter(chunks).boxed()
    }
}

#[async_trait]
impl ManifestSource for MockServer {
    async fn list_files(&self, _job_id: &str) -> Result<Vec<Value>, TransportError> {
        if let Some(status) = *self.manifest_error.lock() {
            return Err(Self::status(status, None));
        }
        Ok(self.manifest.lock().clone())
    }
}

#[async_trait]
impl HttpTransport for MockServer {
    async fn get(&self, url: &Url, range: Option<ByteRange>) -> Result<FileResponse, TransportError> {
        let key = url.to_string();
        self.requests.lock().push((key.clone(), range));

        let data = self
            .files
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::status(404, None))?;
        let reply = self.replies.lock().get_mut(&key).and_then(|q| q.pop_front());

        let (start, end) = match range {
            Some(r) => (r.start as usize, (r.end as usize + 1).min(data.len())),
            None => (0, data.len()),
        };
        if start > end {
            return Err(Self::status(416, None));
        }
        let slice = data[start..end].to_vec();

        match reply {
            Some(Reply::Status(status)) => Err(Self::status(status, None)),
            Some(Reply::RateLimited(after)) => Err(Self::status(429, after)),
            Some(Reply::Refused) => Err(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            ))),
            Some(Reply::DropAfter(n)) => Ok(FileResponse {
                partial: range.is_some(),
                body: Self::body(slice, Some(n)),
            }),
            Some(Reply::IgnoreRange) => Ok(FileResponse {
                partial: false,
                body: Self::body(data, None),
            }),
            Some(Reply::Stall(n)) => {
                let cut = n.min(slice.len());
                let head = Self::body(slice[..cut].to_vec(), None);
                Ok(FileResponse {
                    partial: range.is_some(),
                    body: head.chain(futures::stream::pending()).boxed(),
                })
            }
            Some(Reply::Panic) => panic!("transport blew up on {}", key),
            None => Ok(FileResponse {
                partial: range.is_some(),
                body: Self::body(slice, None),
            }),
        }
    }
}
