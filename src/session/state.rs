//! Lifecycle state and counters of a capture loop.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::CaptureError;

/// Lifecycle of a [`CaptureLoop`](super::CaptureLoop).
///
/// ```text
/// Idle ──start()──▶ Running ──stop() / fatal──▶ Draining ──▶ Stopped
///   └──────────────────stop()──────────────────────────────────▲
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        self == LoopState::Stopped
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Running => "running",
            LoopState::Draining => "draining",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot of a loop's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    /// Frames the backend delivered.
    pub captured: u64,
    /// Frames handed to the processor.
    pub dispatched: u64,
    /// Frames discarded by backpressure. Never decreases.
    pub dropped: u64,
    /// Results accepted by the sink.
    pub presented: u64,
    pub capture_failures: u64,
    pub allocation_failures: u64,
    pub processor_errors: u64,
    pub presentation_errors: u64,
    /// Highest sequence number assigned so far.
    pub last_sequence: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub captured: AtomicU64,
    pub dispatched: AtomicU64,
    pub dropped: AtomicU64,
    pub presented: AtomicU64,
    pub capture_failures: AtomicU64,
    pub allocation_failures: AtomicU64,
    pub processor_errors: AtomicU64,
    pub presentation_errors: AtomicU64,
    pub last_sequence: AtomicU64,
}

impl StatsCounters {
    /// Increment and return the new value.
    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> LoopStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LoopStats {
            captured: load(&self.captured),
            dispatched: load(&self.dispatched),
            dropped: load(&self.dropped),
            presented: load(&self.presented),
            capture_failures: load(&self.capture_failures),
            allocation_failures: load(&self.allocation_failures),
            processor_errors: load(&self.processor_errors),
            presentation_errors: load(&self.presentation_errors),
            last_sequence: load(&self.last_sequence),
        }
    }
}

/// What [`CaptureLoop::join`](super::CaptureLoop::join) returns.
#[derive(Debug, Clone)]
pub struct LoopReport {
    pub label: String,
    pub state: LoopState,
    pub stats: LoopStats,
    /// The error that ended the loop, if it did not stop on request.
    pub error: Option<Arc<CaptureError>>,
}

impl LoopReport {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}
