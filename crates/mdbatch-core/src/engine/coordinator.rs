//! Transfer Coordinator - downloads every file of a batch job
//!
//! One task per target is spawned onto the shared [`WorkerPool`]. Each task
//! holds a pool permit while it runs the retry controller and the verifier.
//! Completions are collected as they arrive; the first fatal error cancels
//! everything still outstanding and becomes the batch result.

use crate::engine::fetcher::RangeFetcher;
use crate::engine::manifest::ManifestResolver;
use crate::engine::pool::WorkerPool;
use crate::engine::reporter::Reporter;
use crate::engine::retry::{RetryController, RetryPolicy};
use crate::engine::verify::IntegrityVerifier;
use crate::error::BatchError;
use crate::transport::{HttpTransport, ManifestSource};
use mdbatch_types::{DownloadReport, TransferEvent, TransferTarget};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// What to download and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub job_id: String,
    /// Parent of the `{job_id}` directory; the downloader default if unset
    pub output_dir: Option<PathBuf>,
    /// Restrict the batch to these filenames
    pub filenames: Option<Vec<String>>,
}

impl DownloadRequest {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            output_dir: None,
            filenames: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_files<I, S>(mut self, filenames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filenames = Some(filenames.into_iter().map(Into::into).collect());
        self
    }
}

/// Batch downloader bound to a shared worker pool
#[derive(Clone)]
pub struct BatchDownloader {
    pool: Arc<WorkerPool>,
    resolver: Arc<ManifestResolver>,
    controller: RetryController,
    verifier: IntegrityVerifier,
    default_output_dir: PathBuf,
    event_tx: broadcast::Sender<TransferEvent>,
}

impl BatchDownloader {
    pub fn new(
        pool: Arc<WorkerPool>,
        manifests: Arc<dyn ManifestSource>,
        transport: Arc<dyn HttpTransport>,
        policy: RetryPolicy,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        Self {
            pool,
            resolver: Arc::new(ManifestResolver::new(manifests)),
            controller: RetryController::new(RangeFetcher::new(transport), policy),
            verifier: IntegrityVerifier::new(),
            default_output_dir: PathBuf::from("."),
            event_tx,
        }
    }

    /// Directory used when a request names none
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_output_dir = dir.into();
        self
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Subscribe to transfer events of every batch run by this downloader
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.event_tx.subscribe()
    }

    /// Download a batch, awaitable from any executor
    ///
    /// The batch itself runs on the pool. Dropping the returned future
    /// cancels it.
    pub async fn download_async(&self, request: DownloadRequest) -> Result<DownloadReport, BatchError> {
        let this = self.clone();
        self.pool
            .spawn(async move { this.run_batch(request).await })
            .await
            .map_err(|e| BatchError::TaskFailed(e.to_string()))?
    }

    /// Download a batch, blocking the calling thread
    ///
    /// Must not be called from one of the pool's own worker threads.
    pub fn download(&self, request: DownloadRequest) -> Result<DownloadReport, BatchError> {
        futures::executor::block_on(self.download_async(request))
    }

    async fn run_batch(self, request: DownloadRequest) -> Result<DownloadReport, BatchError> {
        let filter: Option<HashSet<String>> =
            request.filenames.map(|names| names.into_iter().collect());
        let manifest = self.resolver.resolve(&request.job_id, filter.as_ref()).await?;

        let job_dir = request
            .output_dir
            .unwrap_or_else(|| self.default_output_dir.clone())
            .join(&request.job_id);
        tokio::fs::create_dir_all(&job_dir).await?;
        info!(
            "Downloading {} files of batch job {} to {}",
            manifest.targets().len(),
            request.job_id,
            job_dir.display()
        );

        let reporter = Reporter::new(self.event_tx.clone());
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for target in manifest.into_targets() {
            let transfer = FileTransfer {
                dest: job_dir.join(target.filename()),
                target,
                permits: self.pool.permits(),
                controller: self.controller.clone(),
                verifier: self.verifier,
                reporter: reporter.clone(),
                cancel: cancel.clone(),
            };
            tasks.spawn(transfer.run());
        }

        let mut files = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| BatchError::TaskFailed(e.to_string()))
                .and_then(|result| result);
            match outcome {
                Ok(path) => files.push(path),
                Err(e) => {
                    error!("Batch job {} failed: {}", request.job_id, e);
                    cancel.cancel();
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(e);
                }
            }
        }

        info!("Batch job {} complete: {} files", request.job_id, files.len());
        Ok(DownloadReport {
            job_id: request.job_id,
            files,
            warnings: reporter.take_warnings(),
        })
    }
}

/// Everything one task needs to bring a single file to completion
struct FileTransfer {
    target: TransferTarget,
    dest: PathBuf,
    permits: Arc<Semaphore>,
    controller: RetryController,
    verifier: IntegrityVerifier,
    reporter: Reporter,
    cancel: CancellationToken,
}

impl FileTransfer {
    async fn run(self) -> Result<PathBuf, BatchError> {
        let _permit = tokio::select! {
            permit = WorkerPool::acquire(self.permits.clone()) => permit?,
            _ = self.cancel.cancelled() => return Err(BatchError::Cancelled),
        };

        info!("Downloading {}", self.target.filename());
        let fetched = self
            .controller
            .run(&self.target, &self.dest, &self.reporter, &self.cancel)
            .await?;
        self.verifier
            .verify(&self.target, &self.dest, &self.reporter)
            .await;
        info!(
            "Finished {} ({} bytes transferred)",
            self.target.filename(),
            fetched
        );

        self.reporter.emit(TransferEvent::FileCompleted {
            filename: self.target.filename().to_string(),
            path: self.dest.clone(),
        });
        Ok(self.dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{content, sha256_tag, MockServer, Reply};
    use mdbatch_types::TransferWarning;
    use std::path::Path;
    use std::time::Duration;

    fn downloader(server: &Arc<MockServer>, workers: usize) -> BatchDownloader {
        let pool = Arc::new(WorkerPool::new(workers).unwrap());
        BatchDownloader::new(pool, server.clone(), server.clone(), RetryPolicy::default())
    }

    /// `a` matches its hash, `b` does not, `c` uses an unknown algorithm
    fn abc_server() -> (Arc<MockServer>, Vec<u8>, Vec<u8>, Vec<u8>) {
        let a = content(1, 100);
        let b = content(2, 200);
        let c = content(3, 50);
        let server = MockServer::new()
            .with_file("a", &sha256_tag(&a), a.clone())
            .with_file("b", &sha256_tag(b"not b"), b.clone())
            .with_file("c", "crc32:deadbeef", c.clone());
        (Arc::new(server), a, b, c)
    }

    fn sorted_names(files: &[PathBuf]) -> Vec<String> {
        let mut names: Vec<String> = files
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn sorted_warnings(report: &DownloadReport) -> Vec<String> {
        let mut warnings: Vec<String> = report.warnings.iter().map(ToString::to_string).collect();
        warnings.sort();
        warnings
    }

    #[test]
    fn test_blocking_download_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (server, a, b, c) = abc_server();

        let report = downloader(&server, 1)
            .download(DownloadRequest::new("JOB").with_output_dir(dir.path()))
            .unwrap();

        let job_dir = dir.path().join("JOB");
        assert_eq!(sorted_names(&report.files), ["a", "b", "c"]);
        assert!(report.files.iter().all(|p| p.starts_with(&job_dir)));
        assert_eq!(std::fs::read(job_dir.join("a")).unwrap(), a);
        assert_eq!(std::fs::read(job_dir.join("b")).unwrap(), b);
        assert_eq!(std::fs::read(job_dir.join("c")).unwrap(), c);

        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.warnings_for("a").count(), 0);
        assert!(matches!(
            report.warnings_for("b").next(),
            Some(TransferWarning::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            report.warnings_for("c").next(),
            Some(TransferWarning::UnsupportedChecksum { algorithm, .. }) if algorithm == "crc32"
        ));
    }

    #[tokio::test]
    async fn test_async_and_blocking_entry_points_agree() {
        let async_dir = tempfile::tempdir().unwrap();
        let blocking_dir = tempfile::tempdir().unwrap();
        let (server, ..) = abc_server();
        let downloader = downloader(&server, 1);

        let from_async = downloader
            .download_async(DownloadRequest::new("JOB").with_output_dir(async_dir.path()))
            .await
            .unwrap();

        let blocking = downloader.clone();
        let request = DownloadRequest::new("JOB").with_output_dir(blocking_dir.path());
        let from_blocking = tokio::task::spawn_blocking(move || blocking.download(request))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sorted_names(&from_async.files), sorted_names(&from_blocking.files));
        assert_eq!(sorted_warnings(&from_async), sorted_warnings(&from_blocking));
    }

    #[tokio::test]
    async fn test_rerun_hits_no_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let (server, ..) = abc_server();
        let downloader = downloader(&server, 2);
        let request = DownloadRequest::new("JOB").with_output_dir(dir.path());

        downloader.download_async(request.clone()).await.unwrap();
        let after_first = server.requests().len();
        assert_eq!(after_first, 3);

        let report = downloader.download_async(request).await.unwrap();
        assert_eq!(server.requests().len(), after_first);
        assert_eq!(report.files.len(), 3);
        // Complete files are still verified
        assert_eq!(report.warnings.len(), 2);
    }

    #[tokio::test]
    async fn test_filter_limits_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (server, ..) = abc_server();

        let report = downloader(&server, 1)
            .download_async(
                DownloadRequest::new("JOB")
                    .with_output_dir(dir.path())
                    .with_files(["a", "unknown"]),
            )
            .await
            .unwrap();

        assert_eq!(sorted_names(&report.files), ["a"]);
        assert_eq!(server.requests_for("b").len(), 0);
        assert!(!dir.path().join("JOB").join("b").exists());
    }

    /// `a` conflicts with a larger local file, `b` would wait an hour unless cancelled
    fn conflicting_siblings(dir: &Path) -> (Arc<MockServer>, PathBuf) {
        let a = content(1, 10);
        let b = content(2, 10);
        let server = Arc::new(
            MockServer::new()
                .with_file("a", &sha256_tag(&a), a)
                .with_file("b", &sha256_tag(&b), b),
        );
        server.script("b", vec![Reply::RateLimited(Some("3600"))]);
        let job_dir = dir.join("JOB");
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("a"), content(9, 11)).unwrap();
        (server, job_dir)
    }

    #[tokio::test]
    async fn test_fatal_sibling_fails_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (server, job_dir) = conflicting_siblings(dir.path());

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            downloader(&server, 2)
                .download_async(DownloadRequest::new("JOB").with_output_dir(dir.path())),
        )
        .await
        .expect("batch should be cancelled promptly");

        assert!(matches!(result, Err(BatchError::LocalConflict { .. })));
        assert_eq!(std::fs::read(job_dir.join("a")).unwrap(), content(9, 11));
    }

    #[test]
    fn test_blocking_download_fails_on_fatal_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let (server, job_dir) = conflicting_siblings(dir.path());

        let started = std::time::Instant::now();
        let result = downloader(&server, 2)
            .download(DownloadRequest::new("JOB").with_output_dir(dir.path()));

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(result, Err(BatchError::LocalConflict { .. })));
        assert_eq!(std::fs::read(job_dir.join("a")).unwrap(), content(9, 11));
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let a = content(1, 10);
        let server = Arc::new(MockServer::new().with_file("a", &sha256_tag(&a), a));
        server.script("a", vec![Reply::Panic]);

        let err = downloader(&server, 1)
            .download_async(DownloadRequest::new("JOB").with_output_dir(dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::TaskFailed(_)));
    }

    #[tokio::test]
    async fn test_manifest_errors_create_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(MockServer::new());

        let err = downloader(&server, 1)
            .download_async(DownloadRequest::new("JOB").with_output_dir(dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::Manifest { .. }));
        assert!(!dir.path().join("JOB").exists());
    }

    #[tokio::test]
    async fn test_creates_nested_output_dir_and_emits_events() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("out");
        let (server, ..) = abc_server();
        let downloader = downloader(&server, 1).with_output_dir(&out);
        let mut events = downloader.subscribe();

        let report = downloader
            .download_async(DownloadRequest::new("JOB"))
            .await
            .unwrap();

        let job_dir = out.join("JOB");
        assert!(report.files.iter().all(|p| p.parent() == Some(job_dir.as_path())));
        let mut completed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransferEvent::FileCompleted { .. }) {
                completed += 1;
            }
        }
        assert_eq!(completed, 3);
    }

    #[tokio::test]
    async fn test_shared_pool_serves_concurrent_batches() {
        let (server, ..) = abc_server();
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let first = BatchDownloader::new(pool.clone(), server.clone(), server.clone(), RetryPolicy::default());
        let second = BatchDownloader::new(pool.clone(), server.clone(), server.clone(), RetryPolicy::default());
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();

        let (left, right) = tokio::join!(
            first.download_async(DownloadRequest::new("JOB").with_output_dir(one.path())),
            second.download_async(DownloadRequest::new("JOB").with_output_dir(two.path())),
        );

        assert_eq!(left.unwrap().files.len(), 3);
        assert_eq!(right.unwrap().files.len(), 3);
        assert_eq!(pool.available(), 1);
    }
}
