//! Range-resumable fetcher - one attempt at one file
//!
//! The size of the destination file decides what to request:
//! - absent: plain GET into a fresh file
//! - shorter than expected: ranged GET appended to the file
//! - exactly the expected size: nothing to do
//! - larger than expected: conflict, the file is left alone

use crate::engine::reporter::Reporter;
use crate::error::{BatchError, TransportError};
use crate::transport::{ByteRange, HttpTransport};
use futures::StreamExt;
use mdbatch_types::{TransferEvent, TransferTarget};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(300);

/// What the destination file says about a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    Absent,
    Partial(u64),
    Complete,
    Conflict(u64),
}

impl LocalState {
    pub fn classify(local_size: Option<u64>, expected_size: u64) -> Self {
        match local_size {
            None => LocalState::Absent,
            Some(size) if size < expected_size => LocalState::Partial(size),
            Some(size) if size == expected_size => LocalState::Complete,
            Some(size) => LocalState::Conflict(size),
        }
    }

    pub async fn inspect(path: &Path, expected_size: u64) -> io::Result<Self> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Self::classify(Some(meta.len()), expected_size)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LocalState::Absent),
            Err(e) => Err(e),
        }
    }
}

/// Result of a single fetch attempt
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The file is complete; `fetched` bytes came over the network
    Completed { fetched: u64 },
    /// HTTP 429, with the server's wait hint if it sent a usable one
    RateLimited { retry_after: Option<Duration> },
    Retryable(BatchError),
    Fatal(BatchError),
}

/// Downloads a single target, resuming from whatever is on disk
#[derive(Clone)]
pub struct RangeFetcher {
    transport: Arc<dyn HttpTransport>,
}

impl RangeFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    pub async fn fetch(
        &self,
        target: &TransferTarget,
        dest: &Path,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let expected = target.expected_size();
        let state = match LocalState::inspect(dest, expected).await {
            Ok(state) => state,
            Err(e) => return AttemptOutcome::Retryable(e.into()),
        };

        let range = match state {
            LocalState::Complete => {
                debug!("{} already complete ({} bytes)", target.filename(), expected);
                return AttemptOutcome::Completed { fetched: 0 };
            }
            LocalState::Conflict(local_size) => {
                return AttemptOutcome::Fatal(BatchError::LocalConflict {
                    path: dest.to_path_buf(),
                    local_size,
                    expected_size: expected,
                });
            }
            LocalState::Absent => None,
            LocalState::Partial(offset) => Some(ByteRange::new(offset, expected - 1)),
        };

        // Only 429 is told apart here; everything else goes to the retry loop
        let response = match self.transport.get(target.download_url(), range).await {
            Ok(response) => response,
            Err(e) => return e.into(),
        };

        let resume_from = match range {
            Some(range) if response.partial => range.start,
            Some(range) => {
                debug!(
                    "Server ignored range {} for {}, restarting from zero",
                    range,
                    target.filename()
                );
                0
            }
            None => 0,
        };
        if resume_from > 0 {
            info!("Resuming {} from byte {}", target.filename(), resume_from);
        }

        let mut file = match open_destination(dest, resume_from > 0).await {
            Ok(file) => file,
            Err(e) => return AttemptOutcome::Retryable(e.into()),
        };

        reporter.emit(TransferEvent::FileStarted {
            filename: target.filename().to_string(),
            resume_from,
            total: expected,
        });

        let mut body = response.body;
        let mut fetched: u64 = 0;
        let mut last_progress = Instant::now();
        let stream_error = loop {
            let next = tokio::select! {
                chunk = body.next() => chunk,
                _ = cancel.cancelled() => break Some(BatchError::Cancelled),
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => break Some(e.into()),
                None => break None,
            };

            let would_have = resume_from + fetched + chunk.len() as u64;
            if would_have > expected {
                break Some(BatchError::LocalConflict {
                    path: dest.to_path_buf(),
                    local_size: would_have,
                    expected_size: expected,
                });
            }
            if let Err(e) = file.write_all(&chunk).await {
                break Some(e.into());
            }
            fetched += chunk.len() as u64;

            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                reporter.emit(TransferEvent::FileProgress {
                    filename: target.filename().to_string(),
                    downloaded: resume_from + fetched,
                    total: expected,
                });
                last_progress = Instant::now();
            }
        };

        if let Some(BatchError::LocalConflict { .. }) = &stream_error {
            // Drop this attempt's bytes so the next run resumes from a sane size
            if let Err(e) = file.set_len(resume_from).await {
                debug!("Could not roll back {}: {}", target.filename(), e);
            }
        }

        // Keep whatever arrived; the next attempt resumes from it
        let flushed = flush(&mut file).await;
        drop(file);

        match stream_error {
            Some(e @ (BatchError::Cancelled | BatchError::LocalConflict { .. })) => {
                return AttemptOutcome::Fatal(e)
            }
            Some(e) => return AttemptOutcome::Retryable(e),
            None => {}
        }
        if let Err(e) = flushed {
            return AttemptOutcome::Retryable(e.into());
        }

        let written = resume_from + fetched;
        if written < expected {
            return AttemptOutcome::Retryable(BatchError::IncompleteBody {
                filename: target.filename().to_string(),
                received: written,
                expected,
            });
        }

        reporter.emit(TransferEvent::FileProgress {
            filename: target.filename().to_string(),
            downloaded: written,
            total: expected,
        });
        AttemptOutcome::Completed { fetched }
    }
}

async fn open_destination(path: &Path, append: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    if append {
        options.append(true);
    } else {
        options.write(true).create(true).truncate(true);
    }
    options.open(path).await
}

async fn flush(file: &mut File) -> io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

impl From<TransportError> for AttemptOutcome {
    fn from(e: TransportError) -> Self {
        if e.is_rate_limited() {
            AttemptOutcome::RateLimited {
                retry_after: e.retry_after(),
            }
        } else {
            AttemptOutcome::Retryable(e.into())
        }
    }
}
