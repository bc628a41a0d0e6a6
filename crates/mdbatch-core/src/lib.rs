//! mdbatch core - batch job client and file transfer engine
//!
//! Resolves the file manifest of a batch job and downloads every file into
//! `{output_dir}/{job_id}/`, resuming partial files, honoring rate limits
//! and checking SHA-256 digests.

mod client;
mod engine;
mod error;
mod transport;

pub use client::*;
pub use engine::*;
pub use error::*;
pub use transport::*;

use chrono::{DateTime, Utc};
use mdbatch_types::{BatchJob, DownloadReport, JobState, Settings, SubmitJobRequest, TransferEvent};
use std::sync::Arc;
use tokio::sync::broadcast;

/// The main mdbatch instance
pub struct MdBatch {
    /// Settings the instance was built with
    settings: Settings,
    /// Authenticated API client
    client: Arc<BatchClient>,
    /// Downloader bound to the transfer pool
    downloader: BatchDownloader,
}

impl MdBatch {
    /// Create an instance with its own pool of `settings.max_workers`
    pub fn new(api_key: impl Into<String>, settings: Settings) -> Result<Self, BatchError> {
        let pool = Arc::new(WorkerPool::new(settings.max_workers)?);
        Self::with_pool(api_key, settings, pool)
    }

    /// Create an instance sharing an existing pool
    pub fn with_pool(
        api_key: impl Into<String>,
        settings: Settings,
        pool: Arc<WorkerPool>,
    ) -> Result<Self, BatchError> {
        let client = Arc::new(BatchClient::new(api_key, &settings)?);
        let downloader = BatchDownloader::new(
            pool,
            client.clone(),
            client.clone(),
            RetryPolicy::from(&settings),
        )
        .with_output_dir(settings.output_dir());

        Ok(Self {
            settings,
            client,
            downloader,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn client(&self) -> &BatchClient {
        &self.client
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        self.downloader.pool()
    }

    /// Subscribe to transfer events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.downloader.subscribe()
    }

    /// Validated file manifest of a job
    pub async fn list_files(&self, job_id: &str) -> Result<JobManifest, BatchError> {
        ManifestResolver::new(self.client.clone())
            .resolve(job_id, None)
            .await
    }

    pub async fn list_jobs(
        &self,
        states: &[JobState],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<BatchJob>, BatchError> {
        Ok(self.client.list_jobs(states, since).await?)
    }

    pub async fn submit_job(&self, job: &SubmitJobRequest) -> Result<BatchJob, BatchError> {
        Ok(self.client.submit_job(job).await?)
    }

    /// Download a batch job, blocking the calling thread
    pub fn download(&self, request: DownloadRequest) -> Result<DownloadReport, BatchError> {
        self.downloader.download(request)
    }

    /// Download a batch job
    pub async fn download_async(&self, request: DownloadRequest) -> Result<DownloadReport, BatchError> {
        self.downloader.download_async(request).await
    }
}
