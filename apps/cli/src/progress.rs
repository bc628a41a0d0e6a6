//! Progress bars for batch downloads

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use mdbatch_types::TransferEvent;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// One progress bar per file of a batch
#[derive(Clone)]
pub struct BatchProgress {
    multi: MultiProgress,
    bars: Arc<RwLock<HashMap<String, ProgressBar>>>,
}

impl BatchProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Render events until the channel closes
    pub async fn run(self, mut events: broadcast::Receiver<TransferEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(&event).await,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn bar(&self, filename: &str, total: u64) -> ProgressBar {
        if let Some(pb) = self.bars.read().await.get(filename) {
            return pb.clone();
        }

        let pb = self.multi.add(ProgressBar::new(total));
        if let Ok(template) = ProgressStyle::default_bar().template(
            "{spinner:.green} {msg:30} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        ) {
            pb.set_style(template.progress_chars("█▓▒░  "));
        }
        pb.set_message(filename.to_string());
        self.bars
            .write()
            .await
            .entry(filename.to_string())
            .or_insert(pb)
            .clone()
    }

    /// Update the bars from an event
    pub async fn handle_event(&self, event: &TransferEvent) {
        match event {
            TransferEvent::FileStarted {
                filename,
                resume_from,
                total,
            } => {
                let pb = self.bar(filename, *total).await;
                pb.set_length(*total);
                pb.set_position(*resume_from);
                pb.set_message(filename.clone());
            }

            TransferEvent::FileProgress {
                filename,
                downloaded,
                total,
            } => {
                let pb = self.bar(filename, *total).await;
                pb.set_position(*downloaded);
            }

            TransferEvent::RateLimited {
                filename,
                wait_secs,
            } => {
                if let Some(pb) = self.bars.read().await.get(filename) {
                    pb.set_message(format!(
                        "{} {} (rate limited, {}s)",
                        style("⏸").yellow(),
                        filename,
                        wait_secs
                    ));
                }
            }

            TransferEvent::FileCompleted { filename, .. } => {
                let pb = self.bar(filename, 0).await;
                pb.finish_with_message(format!("{} {}", style("✓").green().bold(), filename));
            }

            // Listed once in the summary after the batch
            TransferEvent::Warning { .. } => {}
        }
    }

    /// Clear all progress bars
    pub async fn clear(&self) {
        for (_, pb) in self.bars.write().await.drain() {
            pb.finish_and_clear();
        }
    }
}

impl Default for BatchProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indicatif::ProgressDrawTarget;
    use mdbatch_types::TransferWarning;

    fn hidden() -> BatchProgress {
        let progress = BatchProgress::new();
        progress.multi.set_draw_target(ProgressDrawTarget::hidden());
        progress
    }

    #[tokio::test]
    async fn test_warnings_are_left_to_the_summary() {
        let progress = hidden();
        progress
            .handle_event(&TransferEvent::Warning {
                warning: TransferWarning::UnsupportedChecksum {
                    filename: "a.dbn".into(),
                    algorithm: "md5".into(),
                },
            })
            .await;
        assert!(progress.bars.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_progress_reuses_the_started_bar() {
        let progress = hidden();
        progress
            .handle_event(&TransferEvent::FileStarted {
                filename: "a.dbn".into(),
                resume_from: 10,
                total: 100,
            })
            .await;
        progress
            .handle_event(&TransferEvent::FileProgress {
                filename: "a.dbn".into(),
                downloaded: 60,
                total: 100,
            })
            .await;

        let bars = progress.bars.read().await;
        assert_eq!(bars.len(), 1);
        assert_eq!(bars["a.dbn"].position(), 60);
        assert_eq!(bars["a.dbn"].length(), Some(100));
    }
}
