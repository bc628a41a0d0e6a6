//! Worker pool shared by every batch download of the process
//!
//! The pool owns a dedicated multi-thread runtime sized to the pool and a
//! semaphore with one permit per worker. Each file transfer holds a permit
//! for its whole lifetime, so the number of concurrent outbound transfers is
//! bounded no matter how many batches share the pool.

use crate::error::BatchError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

/// Bounded transfer pool
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool with `size` workers
    pub fn new(size: usize) -> Result<Self, BatchError> {
        if size == 0 {
            return Err(BatchError::Config(
                "worker pool size must be at least 1".to_string(),
            ));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(size)
            .thread_name("mdbatch-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        debug!("Started transfer pool with {} workers", size);

        Ok(Self {
            runtime: Some(runtime),
            handle,
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Transfers currently allowed to start
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free transfer slot
    pub(crate) async fn acquire(permits: Arc<Semaphore>) -> Result<OwnedSemaphorePermit, BatchError> {
        permits.acquire_owned().await.map_err(|_| BatchError::Cancelled)
    }

    pub(crate) fn permits(&self) -> Arc<Semaphore> {
        self.permits.clone()
    }

    /// Run a future on the pool's runtime
    pub(crate) fn spawn<F>(&self, future: F) -> PoolTask<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        PoolTask {
            handle: self.handle.spawn(future),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics inside an async context.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Handle to a future running on the pool
///
/// Awaitable from any executor. Dropping it aborts the task.
pub(crate) struct PoolTask<T> {
    handle: JoinHandle<T>,
}

impl<T> Future for PoolTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

impl<T> Drop for PoolTask<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
