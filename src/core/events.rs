//! Notifications emitted by the transfer orchestrator.
//!
//! The orchestrator never talks to a UI. It hands typed [`TransferEvent`]s to an
//! [`EventSink`] on its own task; marshaling onto another thread is the sink's
//! business.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::orchestrator::OrchestratorState;
use crate::logging::LogThrottle;

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// The orchestrator entered a new state
    State(OrchestratorState),
    /// Human-readable status line
    Status(String),
    /// Device-side extraction progress, one per `InProgress` poll
    ExtractProgress {
        percentage: f64,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    /// Cumulative payload bytes read during download
    DownloadProgress { bytes_read: u64, total_bytes: u64 },
}

/// Destination for orchestrator notifications.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TransferEvent);
}

impl EventSink for mpsc::UnboundedSender<TransferEvent> {
    fn emit(&self, event: TransferEvent) {
        // A dropped receiver just means nobody is listening anymore
        let _ = self.send(event);
    }
}

/// Discards every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: TransferEvent) {}
}

/// Sink that logs events through `tracing`. Download progress is throttled.
pub struct TracingSink {
    throttle: LogThrottle,
}

impl Default for TracingSink {
    fn default() -> Self {
        Self {
            throttle: LogThrottle::new(Duration::from_millis(500)),
        }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: TransferEvent) {
        match event {
            TransferEvent::State(OrchestratorState::Failed { kind, message }) => {
                warn!(kind = kind.as_str(), error = %message, "Transfer failed");
            }
            TransferEvent::State(state) => debug!(state = state.name(), "State changed"),
            TransferEvent::Status(message) => info!("{}", message),
            TransferEvent::ExtractProgress {
                percentage,
                bytes_transferred,
                total_bytes,
            } => {
                debug!(
                    percentage = %format!("{:.1}", percentage),
                    bytes_transferred, total_bytes, "Extraction progress"
                );
            }
            TransferEvent::DownloadProgress {
                bytes_read,
                total_bytes,
            } => {
                if self.throttle.should_log() || (total_bytes > 0 && bytes_read == total_bytes) {
                    debug!(bytes_read, total_bytes, "Download progress");
                }
            }
        }
    }
}

/// Fans one event out to several sinks, in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: TransferEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
