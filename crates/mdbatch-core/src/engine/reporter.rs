//! Side channel for events and non-fatal warnings of one batch

use mdbatch_types::{TransferEvent, TransferWarning};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Collects warnings for a batch and forwards events to subscribers
#[derive(Clone)]
pub struct Reporter {
    events: broadcast::Sender<TransferEvent>,
    warnings: Arc<Mutex<Vec<TransferWarning>>>,
}

impl Reporter {
    pub fn new(events: broadcast::Sender<TransferEvent>) -> Self {
        Self {
            events,
            warnings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A reporter nobody listens to
    pub fn detached() -> Self {
        let (events, _) = broadcast::channel(16);
        Self::new(events)
    }

    pub fn emit(&self, event: TransferEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Record a warning: logged, kept for the report, broadcast
    pub fn warn(&self, warning: TransferWarning) {
        warn!("{}", warning);
        self.warnings.lock().push(warning.clone());
        self.emit(TransferEvent::Warning { warning });
    }

    pub fn warnings(&self) -> Vec<TransferWarning> {
        self.warnings.lock().clone()
    }

    pub fn take_warnings(&self) -> Vec<TransferWarning> {
        std::mem::take(&mut *self.warnings.lock())
    }
}
