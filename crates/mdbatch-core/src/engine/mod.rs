//! Batch transfer engine
//!
//! - Manifest resolution and validation
//! - Range-resumable single-file fetches
//! - Rate-limit aware retries
//! - SHA-256 integrity checks that warn instead of failing
//! - A shared, bounded worker pool with blocking and async entry points

mod coordinator;
mod fetcher;
mod manifest;
mod pool;
mod reporter;
mod retry;
mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::*;
pub use fetcher::*;
pub use manifest::*;
pub use pool::WorkerPool;
pub use reporter::*;
pub use retry::*;
pub use verify::*;
