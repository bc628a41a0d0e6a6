//! Retry controller wrapped around the range fetcher
//!
//! Two independent channels:
//! - HTTP 429 waits for `Retry-After` (or the default) and retries without bound
//! - any other failure is retried immediately, at most `max_retries` times
//!
//! Every retry goes back through the fetcher, so it resumes from the bytes
//! already on disk.

use crate::engine::fetcher::{AttemptOutcome, RangeFetcher};
use crate::engine::reporter::Reporter;
use crate::error::BatchError;
use mdbatch_types::{Settings, TransferEvent, TransferTarget, TransferWarning};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Default bound of the generic retry channel
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retry limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Immediate retries after the first attempt (total attempts = this + 1)
    pub max_retries: u32,
    /// Wait on 429 when the server sent no usable `Retry-After`
    pub default_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            default_retry_after: Duration::from_secs(1),
        }
    }
}

impl From<&Settings> for RetryPolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries,
            default_retry_after: Duration::from_secs(settings.default_retry_after_secs),
        }
    }
}

/// Runs fetch attempts until the file is complete or a terminal error occurs
#[derive(Clone)]
pub struct RetryController {
    fetcher: RangeFetcher,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(fetcher: RangeFetcher, policy: RetryPolicy) -> Self {
        Self { fetcher, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Returns the bytes fetched by the attempt that completed the file
    pub async fn run(
        &self,
        target: &TransferTarget,
        dest: &Path,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> Result<u64, BatchError> {
        let mut retries: u32 = 0;

        loop {
            match self.fetcher.fetch(target, dest, reporter, cancel).await {
                AttemptOutcome::Completed { fetched } => return Ok(fetched),
                AttemptOutcome::RateLimited { retry_after } => {
                    let wait = retry_after.unwrap_or(self.policy.default_retry_after);
                    info!(
                        "Rate limited while downloading {}, waiting {}s",
                        target.filename(),
                        wait.as_secs()
                    );
                    reporter.emit(TransferEvent::RateLimited {
                        filename: target.filename().to_string(),
                        wait_secs: wait.as_secs(),
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(BatchError::Cancelled),
                    }
                }
                AttemptOutcome::Retryable(cause) => {
                    if retries >= self.policy.max_retries {
                        error!(
                            "Giving up on {} after {} attempts: {}",
                            target.filename(),
                            retries + 1,
                            cause
                        );
                        return Err(BatchError::TransferExhausted {
                            filename: target.filename().to_string(),
                            attempts: retries + 1,
                            source: Box::new(cause),
                        });
                    }
                    retries += 1;
                    reporter.warn(TransferWarning::RetryScheduled {
                        filename: target.filename().to_string(),
                        attempt: retries,
                        max_retries: self.policy.max_retries,
                        cause: cause.to_string(),
                    });
                }
                AttemptOutcome::Fatal(e) => return Err(e),
            }
        }
    }
}
