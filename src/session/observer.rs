//! Loop events and the observer that receives them.

use std::time::Duration;

use tracing::{error, info, warn};

use super::state::LoopState;

/// Something a running loop wants the outside world to know.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    StateChanged {
        from: LoopState,
        to: LoopState,
    },
    /// A captured frame was discarded because the processor was busy.
    FrameDropped {
        sequence: u64,
        total: u64,
    },
    CaptureRetry {
        attempt: u32,
        max: u32,
        delay: Duration,
        error: String,
    },
    /// A capture failed with an error not worth a backoff; the cycle is skipped.
    CaptureSkipped {
        error: String,
    },
    /// The loop is stopping because of this error.
    CaptureFailed {
        error: String,
    },
    AllocationFailed {
        error: String,
    },
    ProcessorFailed {
        sequence: u64,
        error: String,
    },
    /// `sequence` is `None` when `flush` failed.
    PresentationFailed {
        sequence: Option<u64>,
        error: String,
    },
}

/// Receives every [`LoopEvent`] of the loops it is attached to.
///
/// Called from the loop task; implementations must not block.
pub trait LoopObserver: Send + Sync {
    fn on_event(&self, event: &LoopEvent);
}

/// Default observer: forwards events to `tracing` under a loop label.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    label: String,
}

impl TracingObserver {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl LoopObserver for TracingObserver {
    fn on_event(&self, event: &LoopEvent) {
        let label = self.label.as_str();
        match event {
            LoopEvent::StateChanged { from, to } => {
                info!(label, %from, %to, "capture loop state changed");
            }
            LoopEvent::FrameDropped { sequence, total } => {
                warn!(label, sequence, total, "frame dropped, processor busy");
            }
            LoopEvent::CaptureRetry {
                attempt,
                max,
                delay,
                error,
            } => {
                warn!(label, attempt, max, ?delay, %error, "capture failed, retrying");
            }
            LoopEvent::CaptureSkipped { error } => {
                warn!(label, %error, "capture failed, skipping cycle");
            }
            LoopEvent::CaptureFailed { error } => {
                error!(label, %error, "capture loop stopped");
            }
            LoopEvent::AllocationFailed { error } => {
                warn!(label, %error, "no frame buffer, skipping cycle");
            }
            LoopEvent::ProcessorFailed { sequence, error } => {
                warn!(label, sequence, %error, "processor failed");
            }
            LoopEvent::PresentationFailed { sequence, error } => {
                warn!(label, ?sequence, %error, "presentation failed");
            }
        }
    }
}
